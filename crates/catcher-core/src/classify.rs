//! Response classification for claim attempts and listing polls.
//!
//! The claim endpoint is undocumented, so acceptance is inferred from a
//! handful of heuristics. They are kept as an ordered list of pure
//! predicate → verdict rules; the first rule that fires decides.
//!
//! ```text
//! status blocklist ─► 422 challenge ─► redirect to work item ─► challenge markers
//!   ─► external hand-off ─► work-surface markers ─► embedded assignment id
//!   ─► rejection phrase ─► Unknown
//! ```

use std::fmt;

use crate::error::AppError;
use crate::models::HttpReply;

/// Outcome of classifying one claim response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The claim went through. `confidence` is 0..=100.
    Accepted {
        confidence: u8,
        assignment_id: Option<String>,
    },
    Rejected(&'static str),
    Throttled,
    Challenge,
    /// Nothing recognisable. Callers treat this as rejected.
    Unknown,
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Accepted { .. } => "accepted",
            Verdict::Rejected(_) => "rejected",
            Verdict::Throttled => "throttled",
            Verdict::Challenge => "challenge",
            Verdict::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Accepted { confidence, .. } => write!(f, "accepted ({confidence}%)"),
            Verdict::Rejected(reason) => write!(f, "rejected: {reason}"),
            other => f.write_str(other.label()),
        }
    }
}

/// Markers of a human-verification page, matched case-insensitively.
pub const CHALLENGE_MARKERS: &[&str] = &[
    "captchacharacters",
    "validatecaptcha",
    "/captcha/",
    "g-recaptcha",
    "recaptcha-checkbox",
    "captchainput",
    "opfcaptcha",
];

/// Body marker of the "server busy" interstitial the service shows when
/// it sheds load.
const BUSY_MARKER: &str = "continue shopping";

/// Marker of an external work surface the item hands off to.
const HANDOFF_MARKER: &str = "turksubmitto";

/// Markers of the internal work surface. Two or more must be present.
const WORK_SURFACE_MARKERS: &[&str] = &[
    "id=\"thetask\"",
    "id=\"hit-wrapper\"",
    "id=\"task-content\"",
    "id=\"taskcontentbody\"",
    "externalsubmit",
    "mturk_form",
    "crowd-form",
    "data-task-id",
];

/// Phrases the service uses when a claim is refused.
const REJECTION_PHRASES: &[&str] = &[
    "no more available hits",
    "no hits available",
    "there are no more",
    "already accepted the maximum",
    "you have already accepted",
    "you've already accepted",
    "this hit is no longer available",
    "hit is no longer available",
    "you are not qualified",
    "this group has no more",
    "this hit has been deleted",
    "maximum assignments",
];

/// Path segment of the claim endpoint itself; a final URL still pointing
/// there means no redirect to a work item happened.
const CLAIM_PATH_MARKER: &str = "accept_random";

/// Path segment of an individual work-item view.
const WORK_ITEM_PATH: &str = "/tasks/";

const MIN_ASSIGNMENT_ID_LEN: usize = 20;

/// Pre-lowercased view of a reply shared by all rules.
struct Evidence<'a> {
    status: u16,
    url: &'a str,
    url_lower: String,
    body: &'a str,
    body_lower: String,
}

impl<'a> Evidence<'a> {
    fn new(reply: &'a HttpReply) -> Self {
        Self {
            status: reply.status,
            url: &reply.final_url,
            url_lower: reply.final_url.to_ascii_lowercase(),
            body: &reply.body,
            body_lower: reply.body.to_ascii_lowercase(),
        }
    }
}

struct Rule {
    name: &'static str,
    apply: fn(&Evidence<'_>) -> Option<Verdict>,
}

const RULES: &[Rule] = &[
    Rule {
        name: "status",
        apply: rule_status,
    },
    Rule {
        name: "redirect",
        apply: rule_redirect,
    },
    Rule {
        name: "challenge",
        apply: rule_challenge,
    },
    Rule {
        name: "handoff",
        apply: rule_handoff,
    },
    Rule {
        name: "work_surface",
        apply: rule_work_surface,
    },
    Rule {
        name: "assignment_id",
        apply: rule_assignment_id,
    },
    Rule {
        name: "rejection_phrase",
        apply: rule_rejection_phrase,
    },
];

/// Classify a claim response. Pure and deterministic.
pub fn classify(reply: &HttpReply) -> Verdict {
    let evidence = Evidence::new(reply);
    for rule in RULES {
        if let Some(verdict) = (rule.apply)(&evidence) {
            tracing::trace!(rule = rule.name, %verdict, "Claim response classified");
            return verdict;
        }
    }
    Verdict::Unknown
}

fn rule_status(e: &Evidence<'_>) -> Option<Verdict> {
    match e.status {
        429 | 503 => Some(Verdict::Throttled),
        422 => Some(Verdict::Challenge),
        404 | 410 => Some(Verdict::Rejected("not available")),
        500..=599 => Some(Verdict::Rejected("server error")),
        400..=499 => Some(Verdict::Rejected("client error")),
        _ if e.body_lower.contains(BUSY_MARKER) => Some(Verdict::Throttled),
        _ => None,
    }
}

fn rule_redirect(e: &Evidence<'_>) -> Option<Verdict> {
    if e.url_lower.contains(WORK_ITEM_PATH) && !e.url_lower.contains(CLAIM_PATH_MARKER) {
        let assignment_id = token_after(e.url, &e.url_lower, WORK_ITEM_PATH);
        return Some(Verdict::Accepted {
            confidence: 100,
            assignment_id,
        });
    }
    token_after(e.url, &e.url_lower, "assignment_id=").map(|id| Verdict::Accepted {
        confidence: 100,
        assignment_id: Some(id),
    })
}

fn rule_challenge(e: &Evidence<'_>) -> Option<Verdict> {
    if has_challenge_markers(&e.body_lower) || e.url_lower.contains("/captcha") {
        Some(Verdict::Challenge)
    } else {
        None
    }
}

fn rule_handoff(e: &Evidence<'_>) -> Option<Verdict> {
    e.body_lower.contains(HANDOFF_MARKER).then(|| Verdict::Accepted {
        confidence: 90,
        assignment_id: find_assignment_id(e),
    })
}

fn rule_work_surface(e: &Evidence<'_>) -> Option<Verdict> {
    let hits = WORK_SURFACE_MARKERS
        .iter()
        .filter(|m| e.body_lower.contains(*m))
        .count();
    (hits >= 2).then(|| Verdict::Accepted {
        confidence: 75,
        assignment_id: find_assignment_id(e),
    })
}

fn rule_assignment_id(e: &Evidence<'_>) -> Option<Verdict> {
    find_assignment_id(e).map(|id| Verdict::Accepted {
        confidence: 85,
        assignment_id: Some(id),
    })
}

fn rule_rejection_phrase(e: &Evidence<'_>) -> Option<Verdict> {
    REJECTION_PHRASES
        .iter()
        .find(|p| e.body_lower.contains(*p))
        .map(|_| Verdict::Rejected("rejection phrase"))
}

fn find_assignment_id(e: &Evidence<'_>) -> Option<String> {
    ["assignmentid", "assignment_id"]
        .iter()
        .find_map(|marker| token_after(e.body, &e.body_lower, marker))
}

/// Find `marker` in `lower` and return the first run of at least
/// [`MIN_ASSIGNMENT_ID_LEN`] ASCII alphanumerics that follows it, skipping
/// separator characters such as `"`, `=`, `:`, whitespace and `value=`.
///
/// `lower` must be the ASCII-lowercased form of `original` so byte offsets
/// line up.
fn token_after(original: &str, lower: &str, marker: &str) -> Option<String> {
    let mut search_from = 0;
    while let Some(pos) = lower[search_from..].find(marker) {
        let start = search_from + pos + marker.len();
        let rest = &original.as_bytes()[start..];
        let mut i = 0;
        // Skip separators and an optional `value` attribute name.
        while i < rest.len() && i < 16 {
            let b = rest[i];
            if b.is_ascii_alphanumeric() {
                if lower[start + i..].starts_with("value") {
                    i += "value".len();
                    continue;
                }
                break;
            }
            i += 1;
        }
        let token: String = rest[i..]
            .iter()
            .take_while(|b| b.is_ascii_alphanumeric())
            .map(|b| *b as char)
            .collect();
        if token.len() >= MIN_ASSIGNMENT_ID_LEN {
            return Some(token.to_ascii_uppercase());
        }
        search_from = start;
    }
    None
}

/// True if the (already lowercased) text carries a verification marker.
pub fn has_challenge_markers(lower: &str) -> bool {
    CHALLENGE_MARKERS.iter().any(|m| lower.contains(m))
}

/// True if `text` (any case) carries a verification marker.
pub fn is_challenge_page(text: &str) -> bool {
    has_challenge_markers(&text.to_ascii_lowercase())
}

/// Inspect a listing or probe response before its body is parsed.
///
/// Throttle and challenge signals map to [`AppError::Throttled`] and
/// [`AppError::Challenge`]; any other non-200 status is an
/// [`AppError::HttpError`].
pub fn check_listing_reply(reply: &HttpReply) -> Result<(), AppError> {
    match reply.status {
        429 | 503 => return Err(AppError::Throttled(reply.status)),
        422 => return Err(AppError::Challenge),
        _ => {}
    }
    let lower = reply.body.to_ascii_lowercase();
    if has_challenge_markers(&lower) || reply.final_url.to_ascii_lowercase().contains("captcha") {
        return Err(AppError::Challenge);
    }
    if lower.contains(BUSY_MARKER) {
        return Err(AppError::Throttled(reply.status));
    }
    if reply.status != 200 {
        return Err(AppError::HttpError(format!(
            "HTTP {} for {}",
            reply.status, reply.final_url
        )));
    }
    Ok(())
}
