use serde::Serialize;
use tracing::{debug, info};

use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{
    ClassificationRule, EmploymentType, MatchType, MatchedKeyword, RoleType, RuleCategory,
};

const BASE_SCORE: i32 = 50;

/// The text-bearing columns of a job, as read for classification.
#[derive(Debug, Clone, Default)]
pub struct JobText {
    pub job_id: i64,
    pub title: String,
    pub description_text: Option<String>,
    pub employment_text_raw: Option<String>,
    pub experience_text_raw: Option<String>,
    pub tech_stack_text: Option<String>,
}

/// Lowercased concatenation of a job's text fields, one per line.
#[derive(Debug, Clone, PartialEq)]
pub struct TextBlob(String);

impl TextBlob {
    pub fn new(text: &str) -> Self {
        Self(text.to_lowercase())
    }

    pub fn from_job(job: &JobText) -> Self {
        let fields = [
            Some(job.title.as_str()),
            job.description_text.as_deref(),
            job.employment_text_raw.as_deref(),
            job.experience_text_raw.as_deref(),
            job.tech_stack_text.as_deref(),
        ];
        let joined = fields
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        Self::new(&joined)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn matches(&self, match_type: MatchType, keyword: &str) -> bool {
        if keyword.is_empty() {
            return false;
        }
        let keyword = keyword.to_lowercase();
        match match_type {
            MatchType::Exact => self.0 == keyword,
            MatchType::Contains | MatchType::Regex => self.0.contains(&keyword),
        }
    }
}

#[derive(Debug, Clone)]
struct Rule<T> {
    target: T,
    target_value: String,
    keyword: String,
    match_type: MatchType,
    priority: i32,
    weight: i32,
}

impl<T: Copy> Rule<T> {
    fn record(&self, category: RuleCategory) -> MatchedKeyword {
        let (priority, weight) = match category {
            RuleCategory::Score => (None, Some(self.weight)),
            _ => (Some(self.priority), None),
        };
        MatchedKeyword {
            category: category.as_str().to_string(),
            target_value: self.target_value.clone(),
            keyword: self.keyword.clone(),
            priority,
            weight,
        }
    }
}

fn rule_with<T>(rule: &ClassificationRule, target: T) -> Rule<T> {
    Rule {
        target,
        target_value: rule.target_value.clone(),
        keyword: rule.keyword.clone(),
        match_type: rule.match_type,
        priority: rule.priority,
        weight: rule.weight,
    }
}

/// The outcome of classifying one job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub employment_type: EmploymentType,
    pub role_type: RoleType,
    pub new_grad_score: i32,
    pub confidence: f64,
    pub matched_keywords: Vec<MatchedKeyword>,
    pub reasoning: String,
}

/// A rule version's active rules, bucketed by category and kept in
/// `(priority, id)` order within each bucket.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    employment: Vec<Rule<EmploymentType>>,
    role: Vec<Rule<RoleType>>,
    exclude: Vec<Rule<()>>,
    score: Vec<Rule<()>>,
    ignored: usize,
}

impl RuleSet {
    pub fn from_rules(rules: &[ClassificationRule]) -> Result<Self> {
        let mut set = RuleSet::default();
        for rule in rules {
            match RuleCategory::parse(&rule.category) {
                Some(RuleCategory::Employment) => {
                    let target: EmploymentType = rule.target_value.parse()?;
                    set.employment.push(rule_with(rule, target));
                }
                Some(RuleCategory::Role) => {
                    let target: RoleType = rule.target_value.parse()?;
                    set.role.push(rule_with(rule, target));
                }
                Some(RuleCategory::Exclude) => set.exclude.push(rule_with(rule, ())),
                Some(RuleCategory::Score) => set.score.push(rule_with(rule, ())),
                None => set.ignored += 1,
            }
        }

        // Stable sort keeps id order among equal priorities
        set.employment.sort_by_key(|r| r.priority);
        set.role.sort_by_key(|r| r.priority);
        set.exclude.sort_by_key(|r| r.priority);
        set.score.sort_by_key(|r| r.priority);
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.employment.len() + self.role.len() + self.exclude.len() + self.score.len()
    }

    /// Rules whose category the engine does not consume.
    pub fn ignored(&self) -> usize {
        self.ignored
    }

    pub fn classify(&self, blob: &TextBlob) -> Verdict {
        let mut matched = Vec::new();

        let mut employment = EmploymentType::Unknown;
        let mut best_priority: Option<i32> = None;
        for rule in &self.employment {
            if blob.matches(rule.match_type, &rule.keyword) {
                matched.push(rule.record(RuleCategory::Employment));
                if best_priority.is_none_or(|best| rule.priority < best) {
                    best_priority = Some(rule.priority);
                    employment = rule.target;
                }
            }
        }

        let mut excluded = false;
        for rule in &self.exclude {
            if blob.matches(rule.match_type, &rule.keyword) {
                excluded = true;
                matched.push(rule.record(RuleCategory::Exclude));
            }
        }

        let mut role = RoleType::Unknown;
        let mut best_priority: Option<i32> = None;
        for rule in &self.role {
            if blob.matches(rule.match_type, &rule.keyword) {
                matched.push(rule.record(RuleCategory::Role));
                if best_priority.is_none_or(|best| rule.priority < best) {
                    best_priority = Some(rule.priority);
                    role = rule.target;
                }
            }
        }
        if excluded {
            role = RoleType::Unknown;
        }

        let mut score = BASE_SCORE;
        let mut score_hits = 0;
        for rule in &self.score {
            if blob.matches(rule.match_type, &rule.keyword) {
                score += rule.weight;
                score_hits += 1;
                matched.push(rule.record(RuleCategory::Score));
            }
        }
        let score = score.clamp(0, 100);

        let confidence = confidence(employment, role, score_hits);
        let reasoning = format!(
            "employment={}, role={}, score={}, matches={}",
            employment,
            role,
            score,
            matched.len()
        );

        Verdict {
            employment_type: employment,
            role_type: role,
            new_grad_score: score,
            confidence,
            matched_keywords: matched,
            reasoning,
        }
    }
}

fn confidence(employment: EmploymentType, role: RoleType, score_hits: usize) -> f64 {
    let mut confidence = 0.5;
    if employment != EmploymentType::Unknown {
        confidence += 0.2;
    }
    if role != RoleType::Unknown {
        confidence += 0.2;
    }
    confidence += f64::min(0.1, score_hits as f64 * 0.03);
    (confidence.min(1.0) * 1000.0).round() / 1000.0
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifySummary {
    pub rule_version: String,
    pub processed_count: usize,
    pub classified_count: usize,
}

/// Classifies the `limit` most recently updated jobs under `rule_version`.
/// The whole batch is written in one transaction.
pub fn classify_jobs(db: &Database, rule_version: &str, limit: usize) -> Result<ClassifySummary> {
    let rules = db.list_rules(rule_version, true)?;
    if rules.is_empty() {
        return Err(AppError::validation(format!(
            "No active rules found for rule_version={}",
            rule_version
        )));
    }
    let rule_set = RuleSet::from_rules(&rules)?;
    debug!(rule_version, rules = rule_set.len(), "loaded rule set");
    if rule_set.ignored() > 0 {
        debug!(rule_version, ignored = rule_set.ignored(), "skipping rules with unknown categories");
    }

    let jobs = db.jobs_for_classification(limit)?;

    let tx = db.transaction()?;
    let mut classified = 0;
    for job in &jobs {
        let verdict = rule_set.classify(&TextBlob::from_job(job));
        db.upsert_classification(job.job_id, rule_version, &verdict)?;
        classified += 1;
    }
    tx.commit()?;

    info!(rule_version, processed = jobs.len(), classified, "classification finished");

    Ok(ClassifySummary {
        rule_version: rule_version.to_string(),
        processed_count: jobs.len(),
        classified_count: classified,
    })
}
