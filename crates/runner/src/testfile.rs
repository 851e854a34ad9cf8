//! Test file parsing
//!
//! A test file is a header block and a session script separated by the first
//! blank line. Headers are `key: value` pairs; the script is the ordered list
//! of lines the session interpreter executes.

use vmharness_common::{Directive, Error, Result, ScriptLine, TestCase, TimeoutClass};

/// Header key naming the target box. Required in every test file.
pub const BOX_HEADER: &str = "vagrant-box";

/// Parse a complete test file. Pure function of the input text.
pub fn parse(content: &str) -> Result<TestCase> {
    let lines: Vec<&str> = content.split('\n').collect();
    let separator = lines.iter().position(|l| l.is_empty()).ok_or_else(|| {
        Error::MalformedTestFile("no blank line separating headers from script".to_string())
    })?;

    let mut box_name = None;
    let mut title = None;
    let mut directives = Vec::new();

    for header in &lines[..separator] {
        let (key, value) = header.split_once(':').ok_or_else(|| {
            Error::MalformedTestFile(format!("header line without colon: {header:?}"))
        })?;
        let key = key.trim().to_lowercase();
        let value = value.trim().to_string();

        match key.as_str() {
            BOX_HEADER => box_name = Some(value),
            "title" => title = Some(value),
            "vagrant-destroy-if-bash" => directives.push(Directive::DestroyIf(value)),
            "vagrant-precondition-bash" => directives.push(Directive::RemotePrecondition(value)),
            "precondition" => directives.push(Directive::LocalPrecondition(value)),
            "postcondition" => directives.push(Directive::Postcondition(value)),
            "cleanup" => directives.push(Directive::Cleanup(value)),
            // Unknown keys are ignored for forward compatibility.
            _ => {}
        }
    }

    let box_name = box_name.ok_or_else(|| Error::MissingRequiredHeader {
        key: BOX_HEADER.to_string(),
    })?;

    let script = lines[separator + 1..]
        .iter()
        .map(|line| parse_script_line(line))
        .collect::<Result<Vec<_>>>()?;

    Ok(TestCase {
        box_name,
        title,
        directives,
        script,
    })
}

/// Parse one raw script line into its structured form.
///
/// The markers are tried top-to-bottom, first match wins: an optional
/// `$[slow]`/`$[veryslow]` timeout prefix, then `$[run]`, `$[exitcode]`,
/// `$[type]`, and finally a plain expect of the literal text.
pub fn parse_script_line(raw: &str) -> Result<ScriptLine> {
    let (rest, timeout) = strip_timeout_prefix(raw);

    if let Some(command) = rest.strip_prefix("$[run]") {
        return Ok(ScriptLine::Run {
            command: command.to_string(),
        });
    }
    if let Some((left, right)) = rest.split_once("$[exitcode]") {
        let code = right.trim().parse::<i32>().map_err(|_| {
            Error::MalformedTestFile(format!("invalid exit code {:?} in line {raw:?}", right.trim()))
        })?;
        return Ok(ScriptLine::ExpectExitCode {
            preceding: left.trim().to_string(),
            code,
        });
    }
    if let Some((left, right)) = rest.split_once("$[type]") {
        return Ok(ScriptLine::Type {
            expect: left.trim().to_string(),
            input: right.trim().to_string(),
            timeout,
        });
    }
    Ok(ScriptLine::Expect {
        text: rest.to_string(),
        timeout,
    })
}

fn strip_timeout_prefix(raw: &str) -> (&str, TimeoutClass) {
    if let Some(rest) = raw.strip_prefix("$[slow]") {
        (rest, TimeoutClass::Slow)
    } else if let Some(rest) = raw.strip_prefix("$[veryslow]") {
        (rest, TimeoutClass::VerySlow)
    } else {
        (raw, TimeoutClass::Normal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_headers_and_script_in_order() {
        let case = parse(
            "vagrant-box: default\n\
             title: install accepts defaults\n\
             \n\
             $[run]bash install.sh\n\
             How are you today?$[type]great\n\
             ok$[exitcode]0",
        )
        .unwrap();
        assert_eq!(case.box_name, "default");
        assert_eq!(case.title.as_deref(), Some("install accepts defaults"));
        assert_eq!(
            case.script,
            vec![
                ScriptLine::Run {
                    command: "bash install.sh".to_string()
                },
                ScriptLine::Type {
                    expect: "How are you today?".to_string(),
                    input: "great".to_string(),
                    timeout: TimeoutClass::Normal,
                },
                ScriptLine::ExpectExitCode {
                    preceding: "ok".to_string(),
                    code: 0,
                },
            ]
        );
    }

    #[test]
    fn missing_blank_line_is_malformed() {
        let err = parse("vagrant-box: default\ntitle: no script").unwrap_err();
        assert!(matches!(err, Error::MalformedTestFile(_)));
    }

    #[test]
    fn missing_box_header_is_rejected() {
        let err = parse("title: boxless\n\nsome output").unwrap_err();
        assert!(matches!(
            err,
            Error::MissingRequiredHeader { key } if key == BOX_HEADER
        ));
    }

    #[test]
    fn repeated_directives_accumulate_in_file_order() {
        let case = parse(
            "vagrant-box: default\n\
             precondition: env(FIRST)\n\
             postcondition: exists(\"/tmp/a\")\n\
             precondition: env(SECOND)\n\
             cleanup: remove(\"/tmp/a\")\n\
             \n\
             hello",
        )
        .unwrap();
        let pre: Vec<_> = case.local_preconditions().collect();
        assert_eq!(pre, vec!["env(FIRST)", "env(SECOND)"]);
        assert_eq!(case.postconditions().count(), 1);
        assert_eq!(case.cleanups().count(), 1);
    }

    #[test]
    fn unknown_headers_are_ignored() {
        let case = parse("vagrant-box: default\nfuture-directive: whatever\n\nhello").unwrap();
        assert!(case.directives.is_empty());
    }

    #[test]
    fn header_values_may_contain_colons() {
        let case = parse("vagrant-box: default\ntitle: a:b:c\n\nx").unwrap();
        assert_eq!(case.title.as_deref(), Some("a:b:c"));
    }

    #[test]
    fn timeout_prefixes_apply_to_the_remainder() {
        assert_eq!(
            parse_script_line("$[slow]Downloading...").unwrap(),
            ScriptLine::Expect {
                text: "Downloading...".to_string(),
                timeout: TimeoutClass::Slow,
            }
        );
        assert_eq!(
            parse_script_line("$[veryslow]Press enter$[type]").unwrap(),
            ScriptLine::Type {
                expect: "Press enter".to_string(),
                input: String::new(),
                timeout: TimeoutClass::VerySlow,
            }
        );
    }

    #[test]
    fn invalid_exit_code_is_malformed() {
        let err = parse_script_line("done$[exitcode]zero").unwrap_err();
        assert!(matches!(err, Error::MalformedTestFile(_)));
    }
}
