//! Agent stdout scanning.
//!
//! The agent prints free-form text; we only need two facts from it: the host
//! id it registered under and whether it reached the controller.

use std::sync::OnceLock;

use regex::Regex;

/// Literal the agent prints once its controller connection is up.
pub const DEFAULT_READY_MARKER: &str = "Connected to controller";

/// Bytes of trailing output kept between chunks.
const KEEP_TAIL: usize = 512;

fn host_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"Host ID:\s*([0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12})",
        )
        .expect("host id pattern is valid")
    })
}

/// Facts extracted from a piece of agent output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentOutputScan {
    /// Host id, lowercase hyphenated.
    pub host_id: Option<String>,
    /// Whether the readiness marker appeared.
    pub ready: bool,
}

/// Scan a block of agent output.
#[must_use]
pub fn scan_agent_output(text: &str, ready_marker: &str) -> AgentOutputScan {
    let host_id = host_id_regex()
        .captures_iter(text)
        .filter_map(|c| uuid::Uuid::parse_str(&c[1]).ok())
        .last()
        .map(|id| id.hyphenated().to_string());

    AgentOutputScan {
        host_id,
        ready: text.contains(ready_marker),
    }
}

/// Incremental scanner over a chunked, interleaved output stream.
///
/// Chunks can split a line anywhere, so a tail of previous output is kept and
/// rescanned with each new chunk.
#[derive(Debug, Clone)]
pub struct AgentOutputParser {
    marker: String,
    buffer: String,
    host_id: Option<String>,
    ready: bool,
}

impl AgentOutputParser {
    /// Create a parser looking for `ready_marker`.
    #[must_use]
    pub fn new(ready_marker: impl Into<String>) -> Self {
        Self {
            marker: ready_marker.into(),
            buffer: String::new(),
            host_id: None,
            ready: false,
        }
    }

    /// Feed one chunk and return everything known so far.
    pub fn feed(&mut self, chunk: &str) -> AgentOutputScan {
        self.buffer.push_str(chunk);

        let scan = scan_agent_output(&self.buffer, &self.marker);
        if scan.host_id.is_some() {
            self.host_id = scan.host_id;
        }
        self.ready |= scan.ready;

        let keep = KEEP_TAIL.max(self.marker.len() + 64);
        if self.buffer.len() > keep {
            let mut cut = self.buffer.len() - keep;
            while !self.buffer.is_char_boundary(cut) {
                cut += 1;
            }
            self.buffer.drain(..cut);
        }

        self.snapshot()
    }

    /// Current state without feeding.
    #[must_use]
    pub fn snapshot(&self) -> AgentOutputScan {
        AgentOutputScan {
            host_id: self.host_id.clone(),
            ready: self.ready,
        }
    }

    /// Recent output, for error messages.
    #[must_use]
    pub fn tail(&self) -> &str {
        self.buffer.trim()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "3f2b8c1e-9a4d-4e6f-8b21-0c5d7e9f1a2b";

    #[test]
    fn test_scan_finds_host_id_and_marker() {
        let text = format!("starting agent\r\nHost ID: {ID}\r\nConnected to controller\r\n");
        let scan = scan_agent_output(&text, DEFAULT_READY_MARKER);
        assert_eq!(scan.host_id.as_deref(), Some(ID));
        assert!(scan.ready);
    }

    #[test]
    fn test_scan_ignores_malformed_ids() {
        let scan = scan_agent_output("Host ID: not-a-uuid\n", DEFAULT_READY_MARKER);
        assert_eq!(scan, AgentOutputScan::default());
    }

    #[test]
    fn test_uppercase_id_is_normalized() {
        let text = format!("Host ID: {}", ID.to_uppercase());
        let scan = scan_agent_output(&text, DEFAULT_READY_MARKER);
        assert_eq!(scan.host_id.as_deref(), Some(ID));
    }

    #[test]
    fn test_parser_handles_split_chunks() {
        let mut parser = AgentOutputParser::new(DEFAULT_READY_MARKER);
        let (a, b) = ID.split_at(10);

        assert_eq!(parser.feed("[sudo] password for ops: \r\nHost I"), AgentOutputScan::default());
        parser.feed(&format!("D: {a}"));
        let scan = parser.feed(&format!("{b}\r\nConnected to con"));
        assert_eq!(scan.host_id.as_deref(), Some(ID));
        assert!(!scan.ready);

        let scan = parser.feed("troller\r\n");
        assert!(scan.ready);
    }

    #[test]
    fn test_parser_keeps_state_after_buffer_trim() {
        let mut parser = AgentOutputParser::new(DEFAULT_READY_MARKER);
        parser.feed(&format!("Host ID: {ID}\n"));
        parser.feed(&"log line ✓\n".repeat(200));
        assert_eq!(parser.snapshot().host_id.as_deref(), Some(ID));
        assert!(parser.tail().len() <= KEEP_TAIL);
    }
}
