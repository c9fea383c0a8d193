/// Builtin automated-agent signatures, matched case-insensitively as
/// substrings of the user-agent string. Kept lowercase.
const BUILTIN_SIGNATURES: &[&str] = &[
    "googlebot",
    "bingbot",
    "slurp",
    "duckduckbot",
    "baiduspider",
    "yandex",
    "sogou",
    "exabot",
    "facebookexternalhit",
    "facebot",
    "ia_archiver",
    "archive.org_bot",
    "twitterbot",
    "linkedinbot",
    "pinterestbot",
    "applebot",
    "semrushbot",
    "ahrefsbot",
    "mj12bot",
    "dotbot",
    "petalbot",
    "bytespider",
    "crawler",
    "spider",
    "scraper",
    "curl/",
    "wget/",
    "python-requests",
    "go-http-client",
    "java/",
    "libwww-perl",
    "phantomjs",
    "headlesschrome",
    "uptimerobot",
    "pingdom",
    "statuscake",
];

/// Classifies user-agent strings as automated traffic. Pure predicate;
/// an absent or empty agent string is not a bot, favoring recording.
#[derive(Debug, Clone, Default)]
pub struct BotFilter {
    extra_signatures: Vec<String>,
}

impl BotFilter {
    pub fn new(extra_signatures: Vec<String>) -> Self {
        Self {
            extra_signatures: extra_signatures
                .into_iter()
                .map(|signature| signature.trim().to_ascii_lowercase())
                .filter(|signature| !signature.is_empty())
                .collect(),
        }
    }

    pub fn is_bot(&self, user_agent: Option<&str>) -> bool {
        let Some(agent) = user_agent else {
            return false;
        };
        let agent = agent.trim().to_ascii_lowercase();
        if agent.is_empty() {
            return false;
        }
        BUILTIN_SIGNATURES
            .iter()
            .copied()
            .chain(self.extra_signatures.iter().map(String::as_str))
            .any(|signature| agent.contains(signature))
    }
}
