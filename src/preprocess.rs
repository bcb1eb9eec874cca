// src/preprocess.rs
// Report preprocessing: stack parsing, entity and keyword extraction, log aggregation

use crate::report::BugReport;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// Log lines kept after aggregation
const MAX_AGGREGATED_LOGS: usize = 200;
/// Keywords carried into the search query
const QUERY_KEYWORDS: usize = 3;

macro_rules! static_regex {
    ($name:ident, $pattern:expr) => {
        #[allow(clippy::expect_used)]
        static $name: LazyLock<Regex> = LazyLock::new(|| Regex::new($pattern).expect("valid regex"));
    };
}

static_regex!(PYTHON_FRAME_RE, r#"File "([^"]+)", line (\d+), in ([\w<>.]+)"#);
static_regex!(JAVA_FRAME_RE, r"at ([\w.$<>]+)\(([\w$]+\.(?:java|kt|scala)):(\d+)\)");
static_regex!(NODE_FRAME_RE, r"at (?:([\w.$<>\[\] ]+?) \()?((?:/|[A-Za-z]:\\|node:)[^():]+):(\d+):\d+\)?");
static_regex!(GO_FRAME_RE, r"(?m)^\s*([\w./\-]+)\(.*\)\s*\n\s+(/[^\s:]+\.go):(\d+)");
static_regex!(
    EXCEPTION_RE,
    r#"(?m)^\s*(?:Exception in thread "[^"]*"\s+)?(?:Caused by:\s+)?([A-Za-z_][\w.$]*(?:Error|Exception|Warning|Fault)|panic): (.*)$"#
);
static_regex!(JAVA_CAUSED_BY_RE, r"(?m)^\s*Caused by:\s+([\w.$]+): ?(.*)$");
static_regex!(
    FRAMEWORK_RE,
    r"(?i)(site-packages|dist-packages|lib/python|java\.lang\.|java\.util\.|org\.springframework\.|com\.sun\.|^sun\.|fastapi|starlette|uvicorn|asyncio|concurrent|node_modules|node:internal|/usr/local/go/|^runtime[./]|^net/http)"
);
static_regex!(LOG_TIMESTAMP_RE, r"(\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?)");
static_regex!(LOG_ERROR_RE, r"(?i)\b(ERROR|FATAL|CRITICAL|SEVERE|exception|failed|failure)\b");

/// Entity extraction table; capture group 1 is the value.
static ENTITY_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    let table: &[(&str, &str)] = &[
        ("trace_id", r"(?i)(?:x-)?trace[_-]?id[=:\s]+([a-zA-Z0-9-]+)"),
        ("request_id", r"(?i)req(?:uest)?[_-]?id[=:\s]+([a-zA-Z0-9-]+)"),
        ("user_id", r"(?i)\b(?:user[_-]?id|uid)[=:\s]+([a-zA-Z0-9-]+)"),
        ("error_code", r"(?i)error[_-]?code[=:\s]+(\w+)"),
        ("error_code", r"(?i)HTTP[/\s]+\d\.\d\s+(\d{3})"),
        ("api_endpoint", r"\b(?:GET|POST|PUT|DELETE|PATCH)\s+(/[^\s]+)"),
        ("api_endpoint", r"(?i)\b(?:endpoint|path)[=:\s]+(/[^\s]+)"),
        ("service_name", r"(?i)\bservice[=:\s]+([a-zA-Z0-9_-]+)"),
        ("ip_address", r"\b(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})\b"),
    ];
    table
        .iter()
        .filter_map(|(name, pattern)| Regex::new(pattern).ok().map(|re| (*name, re)))
        .collect()
});

/// Error keywords, in reporting order. The label is what gets reported.
static KEYWORD_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    let table: &[(&str, &str)] = &[
        ("timeout", r"(?i)\b(timeout|timed?\s*out|deadline exceeded)\b"),
        ("connection refused", r"(?i)\bconnection\s+refused\b"),
        ("connection reset", r"(?i)\bconnection\s+(reset|closed|aborted)\b"),
        ("rate limit", r"(?i)\b(rate\s*limit|throttl|too many requests)"),
        ("null reference", r"(?i)\b(null\s*pointer|nonetype|none\s*type|nil pointer|undefined is not|cannot read propert)"),
        ("out of memory", r"(?i)\b(out\s+of\s+memory|oom|outofmemoryerror)\b"),
        ("auth failed", r"(?i)\b(auth(?:entication|orization)?\s+(?:failed|error)|unauthorized|401)\b"),
        ("permission denied", r"(?i)\b(permission\s+denied|forbidden|403)\b"),
        ("not found", r"(?i)\b(not\s+found|404)\b"),
        ("internal error", r"(?i)\b(internal\s+(?:server\s+)?error|500)\b"),
        ("bad request", r"(?i)\b(bad\s+request|400)\b"),
        ("bad gateway", r"(?i)\b(bad\s+gateway|502|503|service unavailable)\b"),
        ("deadlock", r"(?i)\b(deadlock|lock wait timeout)\b"),
        ("race condition", r"(?i)\b(race\s+condition|concurrent modification)\b"),
        ("memory leak", r"(?i)\bmemory\s+leak\b"),
        ("stack overflow", r"(?i)\bstack\s*overflow\b"),
        ("decode error", r"(?i)\b(json\s*decode|unmarshal|parse error|invalid json|malformed)\b"),
        ("missing config", r"(?i)\b(missing|not set|undefined)\b.{0,40}\b(config|env|environment variable|setting)"),
    ];
    table
        .iter()
        .filter_map(|(label, pattern)| Regex::new(pattern).ok().map(|re| (*label, re)))
        .collect()
});

/// Stack trace dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StackDialect {
    Python,
    Java,
    Node,
    Go,
}

/// One parsed stack frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackFrame {
    pub file: String,
    pub line: Option<u32>,
    pub function: Option<String>,
    pub is_framework: bool,
}

impl StackFrame {
    fn new(file: &str, line: Option<u32>, function: Option<&str>) -> Self {
        let function = function.map(str::trim).filter(|f| !f.is_empty()).map(str::to_string);
        let is_framework = FRAMEWORK_RE.is_match(file)
            || function.as_deref().is_some_and(|f| FRAMEWORK_RE.is_match(f));
        Self {
            file: file.to_string(),
            line,
            function,
            is_framework,
        }
    }

    /// Whether `path` names the same file, allowing either side to be a
    /// suffix of the other (absolute paths vs repo-relative paths).
    pub fn same_file(&self, path: &str) -> bool {
        same_file(&self.file, path)
    }
}

pub fn same_file(a: &str, b: &str) -> bool {
    let a = a.trim().trim_start_matches("./");
    let b = b.trim().trim_start_matches("./");
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a == b || a.ends_with(&format!("/{}", b)) || b.ends_with(&format!("/{}", a))
}

/// Parsed stack trace. `frames[0]` is where the error was raised.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedStack {
    pub dialect: Option<StackDialect>,
    pub exception_type: Option<String>,
    pub exception_message: Option<String>,
    pub frames: Vec<StackFrame>,
}

impl ParsedStack {
    /// Innermost frame in business (non-framework) code
    pub fn root_frame(&self) -> Option<&StackFrame> {
        self.frames.iter().find(|f| !f.is_framework)
    }

    pub fn business_frames(&self) -> impl Iterator<Item = &StackFrame> {
        self.frames.iter().filter(|f| !f.is_framework)
    }
}

fn parse_line(s: &str) -> Option<u32> {
    s.parse().ok()
}

/// Parse a stack trace in any supported dialect.
pub fn parse_stack(stack: &str) -> ParsedStack {
    let (dialect, frames) = parse_frames(stack);
    let (exception_type, exception_message) = match parse_exception(stack, dialect) {
        Some((t, m)) => (Some(t), Some(m)),
        None => (None, None),
    };
    ParsedStack {
        dialect,
        exception_type,
        exception_message,
        frames,
    }
}

fn parse_frames(stack: &str) -> (Option<StackDialect>, Vec<StackFrame>) {
    // Python prints outermost first; everyone else innermost first.
    let python: Vec<StackFrame> = PYTHON_FRAME_RE
        .captures_iter(stack)
        .map(|c| StackFrame::new(&c[1], parse_line(&c[2]), Some(&c[3])))
        .collect();
    if !python.is_empty() {
        return (Some(StackDialect::Python), python.into_iter().rev().collect());
    }

    let java: Vec<StackFrame> = JAVA_FRAME_RE
        .captures_iter(stack)
        .map(|c| StackFrame::new(&c[2], parse_line(&c[3]), Some(&c[1])))
        .collect();
    if !java.is_empty() {
        return (Some(StackDialect::Java), java);
    }

    let go: Vec<StackFrame> = GO_FRAME_RE
        .captures_iter(stack)
        .map(|c| StackFrame::new(&c[2], parse_line(&c[3]), Some(&c[1])))
        .collect();
    if !go.is_empty() {
        return (Some(StackDialect::Go), go);
    }

    let node: Vec<StackFrame> = NODE_FRAME_RE
        .captures_iter(stack)
        .map(|c| {
            StackFrame::new(
                &c[2],
                parse_line(&c[3]),
                c.get(1).map(|m| m.as_str()),
            )
        })
        .collect();
    if !node.is_empty() {
        return (Some(StackDialect::Node), node);
    }

    (None, Vec::new())
}

fn parse_exception(text: &str, dialect: Option<StackDialect>) -> Option<(String, String)> {
    if dialect == Some(StackDialect::Java)
        && let Some(c) = JAVA_CAUSED_BY_RE.captures_iter(text).last()
    {
        return Some((c[1].to_string(), c[2].trim().to_string()));
    }
    let mut matches = EXCEPTION_RE.captures_iter(text);
    let captures = if dialect == Some(StackDialect::Python) {
        // chained tracebacks end with the exception that escaped
        matches.last()
    } else {
        matches.next()
    }?;
    Some((captures[1].to_string(), captures[2].trim().to_string()))
}

/// Extract known entity kinds. Values keep first-seen order without duplicates.
pub fn extract_entities(text: &str) -> BTreeMap<String, Vec<String>> {
    let mut entities: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, re) in ENTITY_PATTERNS.iter() {
        for captures in re.captures_iter(text) {
            let value = captures[1].to_string();
            let values = entities.entry((*name).to_string()).or_default();
            if !values.contains(&value) {
                values.push(value);
            }
        }
    }
    entities
}

/// Error keyword labels found in `text`, in table order.
pub fn extract_keywords(text: &str) -> Vec<String> {
    KEYWORD_PATTERNS
        .iter()
        .filter(|(_, re)| re.is_match(text))
        .map(|(label, _)| (*label).to_string())
        .collect()
}

/// Keep lines mentioning the trace id (all lines if there is none), order by
/// embedded timestamp, and cap the count. Lines without a timestamp keep
/// their relative order ahead of timestamped ones.
pub fn aggregate_logs(logs: &[String], trace_id: Option<&str>) -> Vec<String> {
    let mut related: Vec<&String> = match trace_id {
        Some(id) => logs.iter().filter(|l| l.contains(id)).collect(),
        None => logs.iter().collect(),
    };
    related.sort_by_key(|line| {
        LOG_TIMESTAMP_RE
            .captures(line)
            .map(|c| c[1].replace('T', " "))
            .unwrap_or_default()
    });
    related
        .into_iter()
        .take(MAX_AGGREGATED_LOGS)
        .cloned()
        .collect()
}

/// Lines that look like error-level log output
pub fn error_logs(logs: &[String]) -> Vec<String> {
    logs.iter().filter(|l| LOG_ERROR_RE.is_match(l)).cloned().collect()
}

/// A report plus everything derived from it once, up front.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreparedReport {
    pub report: BugReport,
    pub stack: ParsedStack,
    pub entities: BTreeMap<String, Vec<String>>,
    pub keywords: Vec<String>,
    pub logs: Vec<String>,
    pub search_query: String,
}

impl PreparedReport {
    pub fn new(report: BugReport) -> Self {
        let info = &report.error_info;
        let mut stack = report.stack_trace().map(parse_stack).unwrap_or_default();
        if stack.exception_type.is_none()
            && let Some((t, m)) = parse_exception(&info.error_message, stack.dialect)
        {
            stack.exception_type = Some(t);
            stack.exception_message = Some(m);
        }

        let text = [
            info.error_message.as_str(),
            report.stack_trace().unwrap_or_default(),
            report.description().unwrap_or_default(),
        ]
        .join(" ");
        let entities = extract_entities(&text);
        let keywords = extract_keywords(&text);
        let logs = aggregate_logs(&report.related_logs, report.trace_id());

        let mut parts: Vec<&str> = vec![info.error_message.trim()];
        if let Some(t) = stack.exception_type.as_deref() {
            parts.push(t);
        }
        parts.extend(keywords.iter().take(QUERY_KEYWORDS).map(String::as_str));
        if let Some(d) = report.description() {
            parts.push(d.trim());
        }
        let search_query = parts.join(" ");

        Self {
            report,
            stack,
            entities,
            keywords,
            logs,
            search_query,
        }
    }

    /// All text a rule may look at: message, code, stack and logs
    pub fn haystack(&self) -> String {
        let info = &self.report.error_info;
        let mut parts = vec![info.error_message.as_str()];
        if let Some(code) = info.error_code.as_deref() {
            parts.push(code);
        }
        if let Some(t) = self.stack.exception_type.as_deref() {
            parts.push(t);
        }
        parts.extend(self.logs.iter().map(String::as_str));
        parts.join("\n")
    }

    /// Business-code files mentioned by the stack trace, innermost first
    pub fn stack_files(&self) -> Vec<String> {
        let mut files: Vec<String> = Vec::new();
        for frame in self.stack.business_frames() {
            if !files.contains(&frame.file) {
                files.push(frame.file.clone());
            }
        }
        files
    }

    pub fn mentions_file(&self, path: &str) -> bool {
        self.stack.frames.iter().any(|f| f.same_file(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PYTHON_STACK: &str = r#"Traceback (most recent call last):
  File "/usr/lib/python3.11/site-packages/starlette/routing.py", line 677, in __call__
    await route.handle(scope, receive, send)
  File "/app/copilot/api/completions.py", line 88, in create_completion
    result = await service.complete(req)
  File "/app/copilot/service/llm.py", line 142, in complete
    return resp.choices[0].text
AttributeError: 'NoneType' object has no attribute 'choices'"#;

    const JAVA_STACK: &str = r#"Exception in thread "main" java.lang.RuntimeException: wrapper
	at com.acme.billing.InvoiceService.render(InvoiceService.java:57)
	at java.lang.Thread.run(Thread.java:750)
Caused by: java.lang.NullPointerException: customer was null
	at com.acme.billing.CustomerRepo.load(CustomerRepo.java:31)
	at com.acme.billing.InvoiceService.render(InvoiceService.java:55)"#;

    const GO_STACK: &str = "panic: runtime error: invalid memory address or nil pointer dereference
goroutine 1 [running]:
main.(*Server).handle(0xc000010000)
	/src/server/handler.go:42 +0x1d
net/http.HandlerFunc.ServeHTTP(0x0)
	/usr/local/go/src/net/http/server.go:2136 +0x29";

    const NODE_STACK: &str = "TypeError: Cannot read properties of undefined (reading 'id')
    at getUser (/srv/app/users.js:14:22)
    at processTicksAndRejections (node:internal/process/task_queues:95:5)";

    // ========================================================================
    // Stack parsing
    // ========================================================================

    #[test]
    fn test_python_stack() {
        let parsed = parse_stack(PYTHON_STACK);
        assert_eq!(parsed.dialect, Some(StackDialect::Python));
        assert_eq!(parsed.frames.len(), 3);
        assert_eq!(parsed.exception_type.as_deref(), Some("AttributeError"));
        assert!(parsed.frames[2].is_framework);
        let root = parsed.root_frame().unwrap();
        assert_eq!(root.file, "/app/copilot/service/llm.py");
        assert_eq!(root.line, Some(142));
        assert_eq!(root.function.as_deref(), Some("complete"));
    }

    #[test]
    fn test_java_stack_prefers_caused_by() {
        let parsed = parse_stack(JAVA_STACK);
        assert_eq!(parsed.dialect, Some(StackDialect::Java));
        assert_eq!(
            parsed.exception_type.as_deref(),
            Some("java.lang.NullPointerException")
        );
        assert_eq!(parsed.exception_message.as_deref(), Some("customer was null"));
        // java.lang.Thread frame is framework code, detected by function
        assert!(parsed.frames.iter().any(|f| f.is_framework));
        assert_eq!(parsed.root_frame().unwrap().file, "InvoiceService.java");
    }

    #[test]
    fn test_go_stack() {
        let parsed = parse_stack(GO_STACK);
        assert_eq!(parsed.dialect, Some(StackDialect::Go));
        assert_eq!(parsed.exception_type.as_deref(), Some("panic"));
        assert_eq!(parsed.frames.len(), 2);
        assert_eq!(parsed.root_frame().unwrap().file, "/src/server/handler.go");
        assert!(parsed.frames[1].is_framework);
    }

    #[test]
    fn test_node_stack() {
        let parsed = parse_stack(NODE_STACK);
        assert_eq!(parsed.dialect, Some(StackDialect::Node));
        assert_eq!(parsed.exception_type.as_deref(), Some("TypeError"));
        let root = parsed.root_frame().unwrap();
        assert_eq!(root.file, "/srv/app/users.js");
        assert_eq!(root.function.as_deref(), Some("getUser"));
    }

    #[test]
    fn test_unparseable_stack() {
        let parsed = parse_stack("something went wrong");
        assert!(parsed.frames.is_empty());
        assert!(parsed.root_frame().is_none());
        assert!(parsed.exception_type.is_none());
    }

    #[test]
    fn test_same_file_suffix_match() {
        assert!(same_file("/app/copilot/service/llm.py", "copilot/service/llm.py"));
        assert!(same_file("./src/a.rs", "src/a.rs"));
        assert!(!same_file("/app/x/llm.py", "other/llm.py"));
        assert!(!same_file("/app/xllm.py", "llm.py"));
        assert!(!same_file("", "llm.py"));
    }

    // ========================================================================
    // Entities and keywords
    // ========================================================================

    #[test]
    fn test_extract_entities() {
        let text = "POST /v1/chat failed trace_id=abc-123 request-id: r-9 error_code=E42 from 10.0.0.7";
        let entities = extract_entities(text);
        assert_eq!(entities["trace_id"], vec!["abc-123"]);
        assert_eq!(entities["request_id"], vec!["r-9"]);
        assert_eq!(entities["error_code"], vec!["E42"]);
        assert_eq!(entities["api_endpoint"], vec!["/v1/chat"]);
        assert_eq!(entities["ip_address"], vec!["10.0.0.7"]);
    }

    #[test]
    fn test_extract_keywords_is_ordered_and_unique() {
        let kws = extract_keywords("Rate limit hit, then TIMEOUT, then another timeout");
        assert_eq!(kws, vec!["timeout", "rate limit"]);
    }

    #[test]
    fn test_null_keyword() {
        let kws = extract_keywords("'NoneType' object has no attribute 'choices'");
        assert!(kws.contains(&"null reference".to_string()));
    }

    // ========================================================================
    // Logs
    // ========================================================================

    #[test]
    fn test_aggregate_logs_filters_and_sorts() {
        let logs = vec![
            "2024-05-01 10:00:03 ERROR tr-1 db timeout".to_string(),
            "2024-05-01 10:00:01 INFO tr-2 unrelated".to_string(),
            "2024-05-01T10:00:02 WARN tr-1 retrying".to_string(),
        ];
        let agg = aggregate_logs(&logs, Some("tr-1"));
        assert_eq!(agg.len(), 2);
        assert!(agg[0].contains("retrying"));
        assert!(agg[1].contains("db timeout"));
    }

    #[test]
    fn test_aggregate_without_trace_keeps_all() {
        let logs = vec!["a".to_string(), "b".to_string()];
        assert_eq!(aggregate_logs(&logs, None).len(), 2);
    }

    #[test]
    fn test_error_logs() {
        let logs = vec!["INFO ok".to_string(), "ERROR bad".to_string(), "job failed".to_string()];
        assert_eq!(error_logs(&logs).len(), 2);
    }

    // ========================================================================
    // Prepared report
    // ========================================================================

    #[test]
    fn test_prepared_report_query() {
        let report = BugReport::from_error("upstream request timed out")
            .with_stack_trace(PYTHON_STACK)
            .with_description("chat hangs for users");
        let prepared = PreparedReport::new(report);
        assert_eq!(
            prepared.search_query,
            "upstream request timed out AttributeError timeout null reference chat hangs for users"
        );
        assert_eq!(
            prepared.stack_files(),
            vec!["/app/copilot/service/llm.py", "/app/copilot/api/completions.py"]
        );
        assert!(prepared.mentions_file("copilot/service/llm.py"));
    }

    #[test]
    fn test_exception_from_message_when_no_stack() {
        let prepared = PreparedReport::new(BugReport::from_error("KeyError: 'user_id'"));
        assert_eq!(prepared.stack.exception_type.as_deref(), Some("KeyError"));
    }
}
