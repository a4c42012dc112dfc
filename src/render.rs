//! HTML error page shown instead of the backend's response

use crate::error::ErrorReport;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};

const STYLE: &str = "\
body { background-color: #2d2d2d; color: #ccc; padding: 20px; }
body, pre { font-family: Consolas, Monaco, 'Andale Mono', 'Ubuntu Mono', monospace; }
pre { font-size: 16px; line-height: 1.6; white-space: pre-wrap; tab-size: 3; }
h1 { font-size: 20px; }
.info { color: #f08d49; }
.quote, .quote span { color: #67cdcc; }
.warning { color: #d4af37; }
.error { color: #e2777a; }
.code { color: #e83e8c; border: 1px solid #e83e8c; font-size: 85%; padding: 3px; border-radius: 6px; }";

/// Words highlighted as errors (matched case-insensitively)
const ERROR_WORDS: &[&str] = &[
    "error", "errors", "failed", "fail", "undefined", "wrong", "invalid", "closed", "nil",
    "unexported", "panicked", "cannot",
];

/// Language keywords highlighted as info
const INFO_WORDS: &[&str] = &[
    "untyped", "type", "types", "const", "constant", "return", "select", "struct", "range",
    "implement", "fn", "impl", "trait", "enum",
];

/// Build a `500 Internal Server Error` carrying the rendered page.
pub fn error_response(report: &ErrorReport) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(hyper::header::CONTENT_TYPE, "text/html; charset=utf-8")
        .body(
            Full::new(Bytes::from(render_error_page(report)))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response builder")
}

pub fn render_error_page(report: &ErrorReport) -> String {
    let output = String::from_utf8_lossy(&report.output);
    format!(
        "<html>\n<head>\n<style>\n{}\n</style>\n</head>\n<body>\n<h1>{}</h1>\n<pre>{}</pre>\n</body>\n</html>\n",
        STYLE,
        escape_html(&report.error),
        highlight(&output)
    )
}

/// Escape and colour build output token by token.
///
/// `path: line: message` chains are split so each segment sits one tab
/// deeper than the last.
fn highlight(output: &str) -> String {
    let mut lines = Vec::new();

    for line in output.lines() {
        let parts: Vec<&str> = line.split(": ").collect();
        let last = parts.len() - 1;
        for (depth, part) in parts.iter().enumerate() {
            let indent = "\t".repeat(depth);
            let segment = if depth < last {
                format!("{}{}:", indent, part)
            } else {
                format!("{}{}", indent, part)
            };
            lines.push(colorize(&segment));
        }
        if last > 0 {
            lines.push(String::new());
        }
    }

    lines.join("\n")
}

/// Escape `segment` and wrap recognised tokens in coloured spans.
fn colorize(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for (class, text) in tokenize(segment) {
        match class {
            Some(class) => {
                out.push_str(&format!("<span class=\"{}\">{}</span>", class, escape_html(text)))
            }
            None => out.push_str(&escape_html(text)),
        }
    }
    out
}

/// Split `text` into plain runs and classed tokens.
fn tokenize(text: &str) -> Vec<(Option<&'static str>, &str)> {
    let mut tokens = Vec::new();
    let mut plain_start = 0;
    let mut i = 0;

    while let Some(c) = text[i..].chars().next() {
        let rest = &text[i..];
        let at_boundary = !text[..i].chars().next_back().is_some_and(is_word_char);

        let (class, len) = match c {
            '"' | '\'' => match rest[1..].find(c) {
                Some(close) => (Some("quote"), close + 2),
                None => (None, 1),
            },
            '<' => match angle_len(rest) {
                Some(n) => (Some("warning"), n),
                None => (None, 1),
            },
            c if c.is_ascii_digit() && at_boundary => {
                (Some("info"), run_len(rest, |c| c.is_ascii_digit()))
            }
            c if is_word_char(c) => {
                let n = run_len(rest, is_word_char);
                let word = &rest[..n];
                if at_boundary && (word == "expected" || word == "unexpected") {
                    if let Some(operand) = expected_operand(&rest[n..]) {
                        // The word and its space stay plain; only the operand is marked.
                        let operand_start = i + n + 1;
                        push_plain(&mut tokens, text, plain_start, operand_start);
                        tokens.push((Some("code"), operand));
                        i = operand_start + operand.len();
                        plain_start = i;
                        continue;
                    }
                }
                (classify_word(word), n)
            }
            c => (None, c.len_utf8()),
        };

        if let Some(class) = class {
            push_plain(&mut tokens, text, plain_start, i);
            tokens.push((Some(class), &rest[..len]));
            plain_start = i + len;
        }
        i += len;
    }

    push_plain(&mut tokens, text, plain_start, text.len());
    tokens
}

fn push_plain<'a>(tokens: &mut Vec<(Option<&'static str>, &'a str)>, text: &'a str, from: usize, to: usize) {
    if from < to {
        tokens.push((None, &text[from..to]));
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn run_len(text: &str, pred: impl Fn(char) -> bool) -> usize {
    text.find(|c: char| !pred(c)).unwrap_or(text.len())
}

/// Length of a `<...>` token with no whitespace inside, such as a generic.
fn angle_len(text: &str) -> Option<usize> {
    let inner = run_len(&text[1..], |c| !c.is_whitespace() && c != '<' && c != '>');
    (inner > 0 && text[1 + inner..].starts_with('>')).then_some(inner + 2)
}

/// The token after `expected ` up to the next whitespace or comma.
fn expected_operand(after: &str) -> Option<&str> {
    let operand = after.strip_prefix(' ')?;
    let n = run_len(operand, |c| !c.is_whitespace() && c != ',');
    (n > 0).then(|| &operand[..n])
}

fn classify_word(word: &str) -> Option<&'static str> {
    let lower = word.to_lowercase();
    if lower == "warning" || lower == "warnings" {
        Some("warning")
    } else if ERROR_WORDS.contains(&lower.as_str()) {
        Some("error")
    } else if lower == "missing" {
        Some("code")
    } else if INFO_WORDS.contains(&word) {
        Some("info")
    } else {
        None
    }
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&#34;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(output: &str, error: &str) -> ErrorReport {
        ErrorReport {
            output: output.as_bytes().to_vec(),
            error: error.to_string(),
        }
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html(r#"<a href="x">'&'</a>"#),
            "&lt;a href=&#34;x&#34;&gt;&#39;&amp;&#39;&lt;/a&gt;"
        );
    }

    #[test]
    fn test_page_contains_error_and_escaped_output() {
        let page = render_error_page(&report("Vec<u8> mismatch", "build error: exit status: 1"));

        assert!(page.contains("<h1>build error: exit status: 1</h1>"));
        assert!(page.contains("Vec<span class=\"warning\">&lt;u8&gt;</span> mismatch"));
        assert!(!page.contains("Vec<u8>"));
    }

    #[test]
    fn test_colon_chains_are_indented() {
        let out = highlight("src/main.rs:3: expected item");

        assert_eq!(
            out,
            "src/main.rs:<span class=\"info\">3</span>:\n\texpected <span class=\"code\">item</span>\n"
        );
    }

    #[test]
    fn test_error_and_warning_words_are_coloured() {
        let out = highlight("warning unused variable\nerror[E0425] cannot find value\nall good");
        let lines: Vec<&str> = out.lines().collect();

        assert_eq!(lines[0], "<span class=\"warning\">warning</span> unused variable");
        assert_eq!(
            lines[1],
            "<span class=\"error\">error</span>[E0425] <span class=\"error\">cannot</span> find value"
        );
        assert_eq!(lines[2], "all good");
    }

    #[test]
    fn test_quotes_numbers_and_keywords_are_coloured() {
        let out = colorize(r#"line 12 "bad & worse" in struct 'x' v2"#);

        assert_eq!(
            out,
            "line <span class=\"info\">12</span> \
             <span class=\"quote\">&#34;bad &amp; worse&#34;</span> in \
             <span class=\"info\">struct</span> \
             <span class=\"quote\">&#39;x&#39;</span> v2"
        );
    }

    #[test]
    fn test_expected_operand_stops_at_comma() {
        let out = colorize("expected `Vec<u8>`, found `&str`");

        assert_eq!(
            out,
            "expected <span class=\"code\">`Vec&lt;u8&gt;`</span>, found `&amp;str`"
        );
    }

    #[test]
    fn test_unclosed_quote_and_bracket_stay_plain() {
        assert_eq!(colorize("it's a < b"), "it&#39;s a &lt; b");
    }

    #[test]
    fn test_multibyte_text_is_preserved() {
        assert_eq!(colorize("café ✗ 9"), "café ✗ <span class=\"info\">9</span>");
    }

    #[test]
    fn test_empty_output_renders_empty_pre() {
        let page = render_error_page(&report("", "failed to start app: timed out"));
        assert!(page.contains("<pre></pre>"));
    }

    #[test]
    fn test_error_response_is_html_500() {
        let response = error_response(&report("boom", "build error: exit status: 1"));

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers().get(hyper::header::CONTENT_TYPE).unwrap(),
            "text/html; charset=utf-8"
        );
    }
}
