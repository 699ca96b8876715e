//! Reviewer reply parsing.
//!
//! The reviewer is asked to open with `APPROVED` or `REJECTED` followed by
//! feedback. Replies without a clear verdict count as rejections, so an
//! ambiguous reviewer can never complete a task.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static VERDICT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^[\s>#*_`]*(?:verdict\s*:\s*)?[*_`]*(APPROVED|REJECTED)\b[*_`]*[ \t:.\-]*")
        .expect("VERDICT_LINE regex should compile")
});

static NEGATED_APPROVAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bnot\s+approved\b").expect("NEGATED_APPROVAL regex should compile"));

/// Parsed reviewer decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewVerdict {
    pub approved: bool,
    pub feedback: String,
}

/// Parse a reviewer reply.
///
/// The first line-leading `APPROVED`/`REJECTED` decides. Without one, an
/// unnegated `APPROVED` anywhere approves and everything else rejects.
pub fn parse_review(reply: &str) -> ReviewVerdict {
    if let Some(caps) = VERDICT_LINE.captures(reply) {
        let approved = caps[1].eq_ignore_ascii_case("APPROVED");
        let rest = reply[caps.get(0).map(|m| m.end()).unwrap_or(0)..].trim();
        let feedback = if rest.is_empty() {
            if approved { "Approved." } else { "Rejected without feedback." }.to_string()
        } else {
            rest.to_string()
        };
        return ReviewVerdict { approved, feedback };
    }

    let upper = reply.to_ascii_uppercase();
    let approved =
        upper.contains("APPROVED") && !upper.contains("REJECTED") && !NEGATED_APPROVAL.is_match(reply);
    ReviewVerdict {
        approved,
        feedback: reply.trim().to_string(),
    }
}
