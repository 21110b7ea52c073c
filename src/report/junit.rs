//! JUnit XML report generation.
//!
//! Converts a finished [`Report`] into the JUnit format understood by CI
//! systems. One `<testcase>` is written per unit, carrying the terminal
//! outcome only:
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites tests="3" failures="1" errors="1" time="4.210">
//!   <testsuite name="e2e" tests="3" failures="1" errors="1" skipped="0" time="4.210">
//!     <testcase classname="checkout" name="guest" time="0.812"/>
//!     <testcase classname="checkout" name="member" time="1.520">
//!       <failure message="title mismatch" type="failure">...stack...</failure>
//!     </testcase>
//!     <testcase classname="e2e" name="search" time="60.000">
//!       <error message="context exceeded timeout of 60s" type="timeout"/>
//!     </testcase>
//!   </testsuite>
//! </testsuites>
//! ```
//!
//! Failures are assertion-style `<failure>`s reported by the unit; crashes
//! become `<error>`s typed by their cause.

use std::path::Path;

use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use crate::aggregate::{Report, UnitResult};
use crate::outcome::{Outcome, UnitError};

/// Renders `report` as a JUnit XML document.
pub fn render(report: &Report, suite_name: &str) -> anyhow::Result<String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let tests = report.results.len();
    let failures = report
        .results
        .iter()
        .filter(|r| matches!(r.outcome, Outcome::Failure { .. }))
        .count();
    let errors = report
        .results
        .iter()
        .filter(|r| matches!(r.outcome, Outcome::Crash { .. }))
        .count();
    let time = format!("{:.3}", report.summary.duration_ms.as_secs_f64());

    let mut testsuites = BytesStart::new("testsuites");
    testsuites.push_attribute(("tests", tests.to_string().as_str()));
    testsuites.push_attribute(("failures", failures.to_string().as_str()));
    testsuites.push_attribute(("errors", errors.to_string().as_str()));
    testsuites.push_attribute(("time", time.as_str()));
    writer.write_event(Event::Start(testsuites))?;

    let mut testsuite = BytesStart::new("testsuite");
    testsuite.push_attribute(("name", suite_name));
    testsuite.push_attribute(("tests", tests.to_string().as_str()));
    testsuite.push_attribute(("failures", failures.to_string().as_str()));
    testsuite.push_attribute(("errors", errors.to_string().as_str()));
    testsuite.push_attribute(("skipped", "0"));
    testsuite.push_attribute(("time", time.as_str()));
    testsuite.push_attribute((
        "timestamp",
        report.summary.started_at.format("%Y-%m-%dT%H:%M:%S").to_string().as_str(),
    ));
    writer.write_event(Event::Start(testsuite))?;

    for result in &report.results {
        write_testcase(&mut writer, result, suite_name)?;
    }

    writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
    writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

    Ok(String::from_utf8(writer.into_inner())?)
}

/// Renders `report` and writes it to `path`, creating parent directories.
pub fn write_junit(report: &Report, path: &Path, suite_name: &str) -> anyhow::Result<()> {
    let xml = render(report, suite_name)?;
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, xml)?;
    Ok(())
}

fn write_testcase<W: std::io::Write>(
    writer: &mut Writer<W>,
    result: &UnitResult,
    suite_name: &str,
) -> anyhow::Result<()> {
    let (classname, name) = split_unit_id(&result.unit.id, suite_name);

    let mut testcase = BytesStart::new("testcase");
    testcase.push_attribute(("classname", classname.as_str()));
    testcase.push_attribute(("name", name));
    testcase.push_attribute((
        "time",
        format!("{:.3}", result.outcome.duration().as_secs_f64()).as_str(),
    ));

    match &result.outcome {
        Outcome::Success { .. } => {
            writer.write_event(Event::Empty(testcase))?;
        }
        Outcome::Failure { error, .. } => {
            writer.write_event(Event::Start(testcase))?;
            write_problem(writer, "failure", "failure", error)?;
            writer.write_event(Event::End(BytesEnd::new("testcase")))?;
        }
        Outcome::Crash { cause, error, .. } => {
            writer.write_event(Event::Start(testcase))?;
            write_problem(writer, "error", &cause.to_string(), error)?;
            writer.write_event(Event::End(BytesEnd::new("testcase")))?;
        }
    }

    Ok(())
}

fn write_problem<W: std::io::Write>(
    writer: &mut Writer<W>,
    tag: &str,
    kind: &str,
    error: &UnitError,
) -> anyhow::Result<()> {
    let message = sanitize(error.short_message());
    let mut element = BytesStart::new(tag);
    element.push_attribute(("message", message.as_str()));
    element.push_attribute(("type", kind));

    match &error.stack {
        Some(stack) => {
            writer.write_event(Event::Start(element))?;
            writer.write_event(Event::Text(BytesText::new(&sanitize(stack))))?;
            writer.write_event(Event::End(BytesEnd::new(tag)))?;
        }
        None => {
            writer.write_event(Event::Empty(element))?;
        }
    }
    Ok(())
}

/// Splits a unit id into JUnit `classname` and `name`.
///
/// `checkout/guest` becomes (`checkout`, `guest`) and `a::b::c` becomes
/// (`a.b`, `c`); ids without a separator use the suite name as classname.
fn split_unit_id<'a>(id: &'a str, suite_name: &'a str) -> (String, &'a str) {
    let split = id
        .rfind("::")
        .map(|idx| (idx, 2))
        .or_else(|| id.rfind('/').map(|idx| (idx, 1)));

    match split {
        Some((idx, len)) if idx > 0 && idx + len < id.len() => {
            let classname = id[..idx].replace("::", ".").replace('/', ".");
            (classname, &id[idx + len..])
        }
        _ => (suite_name.to_string(), id),
    }
}

/// Drops characters that are not allowed in XML 1.0.
///
/// Markup escaping is done by quick-xml itself.
fn sanitize(s: &str) -> String {
    s.chars()
        .filter(|c| matches!(c, '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}' | '\u{10000}'..))
        .collect()
}
