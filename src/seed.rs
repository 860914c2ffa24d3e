use tracing::info;

use crate::db::Database;
use crate::error::Result;
use crate::models::NewRule;

pub const DEFAULT_RULE_VERSION: &str = "v1.0.0";

/// (code, name, base_url)
const SOURCES: &[(&str, &str, &str)] = &[
    ("remotive", "Remotive", "https://remotive.com"),
    ("moloco_gh", "Moloco (Greenhouse)", "https://boards.greenhouse.io/moloco"),
    ("sendbird_gh", "Sendbird (Greenhouse)", "https://boards.greenhouse.io/sendbird"),
    ("dunamu_gh", "Dunamu (Greenhouse)", "https://boards.greenhouse.io/dunamu"),
];

const CRAWL_INTERVAL_MIN: i64 = 360;

/// (target_value, keyword, priority)
const EMPLOYMENT_RULES: &[(&str, &str, i32)] = &[
    ("intern_convertible", "conversion to full-time", 5),
    ("intern_convertible", "return offer", 5),
    ("intern_convertible", "전환형", 5),
    ("intern_experience", "intern", 10),
    ("intern_experience", "인턴", 10),
    ("new_grad", "new grad", 20),
    ("new_grad", "new graduate", 20),
    ("new_grad", "entry level", 20),
    ("new_grad", "entry-level", 20),
    ("new_grad", "신입", 20),
    ("new_grad", "junior", 30),
    ("experienced", "years of experience", 50),
    ("experienced", "경력", 50),
];

const ROLE_RULES: &[(&str, &str, i32)] = &[
    ("fullstack", "fullstack", 5),
    ("fullstack", "full-stack", 5),
    ("fullstack", "full stack", 5),
    ("backend", "backend", 10),
    ("backend", "back-end", 10),
    ("backend", "server", 30),
    ("frontend", "frontend", 10),
    ("frontend", "front-end", 10),
    ("frontend", "react", 30),
    ("data", "data engineer", 10),
    ("data", "machine learning", 20),
    ("data", "ml engineer", 20),
    ("mobile", "ios", 10),
    ("mobile", "android", 10),
    ("mobile", "mobile", 20),
    ("devops", "devops", 10),
    ("devops", "site reliability", 10),
    ("devops", "infrastructure", 30),
];

const EXCLUDE_KEYWORDS: &[&str] = &["senior", "staff", "principal", "lead", "manager"];

/// (keyword, weight)
const SCORE_RULES: &[(&str, i32)] = &[
    ("new grad", 30),
    ("신입", 30),
    ("entry level", 25),
    ("junior", 20),
    ("no experience required", 20),
    ("intern", 15),
    ("0-2 years", 15),
    ("senior", -30),
    ("5+ years", -30),
    ("7+ years", -40),
    ("staff", -25),
    ("lead", -20),
];

#[derive(Debug, Default, Clone, PartialEq)]
pub struct SeedStats {
    pub sources_inserted: usize,
    pub rules_inserted: usize,
}

/// The built-in `v1.0.0` rule set.
pub fn default_rules() -> Vec<NewRule> {
    let v = DEFAULT_RULE_VERSION;
    let mut rules = Vec::new();

    for (target, keyword, priority) in EMPLOYMENT_RULES {
        rules.push(NewRule::new(v, "employment", target, keyword).priority(*priority));
    }
    for (target, keyword, priority) in ROLE_RULES {
        rules.push(NewRule::new(v, "role", target, keyword).priority(*priority));
    }
    for keyword in EXCLUDE_KEYWORDS {
        rules.push(NewRule::new(v, "exclude", keyword, keyword).priority(10));
    }
    for (keyword, weight) in SCORE_RULES {
        let target = if *weight >= 0 { "new_grad" } else { "experienced" };
        rules.push(NewRule::new(v, "score", target, keyword).weight(*weight));
    }
    rules
}

impl Database {
    /// Inserts the default sources and rule set. Existing rows are left as they are.
    pub fn seed_defaults(&self) -> Result<SeedStats> {
        let tx = self.transaction()?;
        let mut stats = SeedStats::default();

        for (code, name, base_url) in SOURCES {
            if self.insert_source(code, name, base_url, CRAWL_INTERVAL_MIN)? {
                stats.sources_inserted += 1;
            }
        }
        for rule in default_rules() {
            if self.insert_rule(&rule)? {
                stats.rules_inserted += 1;
            }
        }

        tx.commit()?;
        info!(
            sources = stats.sources_inserted,
            rules = stats.rules_inserted,
            "seeded defaults"
        );
        Ok(stats)
    }
}
