//! Reads test durations out of JUnit XML reports.
//!
//! Each `<testcase classname="..." name="..." time="...">` becomes a
//! `(classname.name, nanos)` pair, which is the identifier format the
//! duration store and the allocator use.

use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;

/// Extracts `(test id, duration in nanoseconds)` for every test case.
///
/// A missing or unparsable `time` attribute yields zero, which the caller
/// treats as "unknown duration".
///
/// # Example
///
/// ```
/// use podfork::durations::junit::durations_from_junit_xml;
///
/// let xml = r#"<testsuite><testcase classname="a.B" name="c" time="0.5"/></testsuite>"#;
/// let cases = durations_from_junit_xml(xml).unwrap();
/// assert_eq!(cases, vec![("a.B.c".to_string(), 500_000_000)]);
/// ```
pub fn durations_from_junit_xml(xml: &str) -> Result<Vec<(String, i64)>, quick_xml::Error> {
    let mut reader = Reader::from_str(xml);
    let mut cases = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) if e.name().as_ref() == b"testcase" => {
                if let Some(case) = parse_testcase(&e)? {
                    cases.push(case);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(cases)
}

fn parse_testcase(e: &BytesStart<'_>) -> Result<Option<(String, i64)>, quick_xml::Error> {
    let mut classname = None;
    let mut name = None;
    let mut time = None;

    for attr in e.attributes() {
        let attr = attr?;
        let value = attr.unescape_value()?.into_owned();
        match attr.key.as_ref() {
            b"classname" => classname = Some(value),
            b"name" => name = Some(value),
            b"time" => time = Some(value),
            _ => {}
        }
    }

    let Some(name) = name else {
        return Ok(None);
    };

    let id = match classname {
        Some(classname) if !classname.is_empty() => format!("{}.{}", classname, name),
        _ => name,
    };

    Ok(Some((id, time.as_deref().map(seconds_to_nanos).unwrap_or(0))))
}

/// Converts a JUnit `time` attribute (seconds, possibly with thousands
/// separators) to nanoseconds.
fn seconds_to_nanos(time: &str) -> i64 {
    time.replace(',', "")
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(|secs| (secs * 1_000_000_000.0).round() as i64)
        .unwrap_or(0)
}
