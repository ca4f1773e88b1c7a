//! Deterministic pattern rules.
//!
//! Text is split into ordered segments on "then" / "after that". Each
//! segment yields tasks (by verb + target) and at most one schedule; tasks
//! of a segment depend on every task of the segment before it.

use std::collections::BTreeSet;

use async_trait::async_trait;
use autoloom_core::error::{AutoloomError, Result};
use autoloom_core::types::{TaskSpec, TriggerSpec};
use regex::Regex;

use super::IntentSource;

/// Canonical platform name and the spellings recognised for it.
const PLATFORMS: &[(&str, &[&str])] = &[
    ("twitter", &["twitter", "x.com"]),
    ("instagram", &["instagram", "insta", "ig"]),
    ("facebook", &["facebook", "fb"]),
    ("linkedin", &["linkedin"]),
    ("tiktok", &["tiktok", "tik tok"]),
    ("reddit", &["reddit"]),
    ("youtube", &["youtube", "yt"]),
    ("github", &["github"]),
    ("discord", &["discord"]),
    ("telegram", &["telegram"]),
];

/// Cron day-of-week order.
const WEEKDAYS: [&str; 7] = [
    "sunday",
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
];

/// What a rule needs besides its verb.
#[derive(Clone, Copy)]
enum Target {
    Platform,
    Url,
    Nothing,
}

struct TaskRule {
    task_type: &'static str,
    verb: Regex,
    target: Target,
}

pub struct PatternSource {
    default_hour: u32,
    sequence: Regex,
    rules: Vec<TaskRule>,
    platform: Regex,
    count: Regex,
    url: Regex,
    every_n: Regex,
    twice_daily: Regex,
    hourly: Regex,
    weekday: Regex,
    weekly: Regex,
    monthly: Regex,
    daily: Regex,
    time_of_day: Regex,
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| AutoloomError::config(format!("invalid pattern {pattern}: {e}")))
}

impl PatternSource {
    /// `default_hour` is used by daily/weekly/monthly phrases without "at H".
    pub fn new(default_hour: u32) -> Result<Self> {
        let mut aliases: Vec<&str> = PLATFORMS.iter().flat_map(|(_, a)| a.iter().copied()).collect();
        aliases.sort_by_key(|a| std::cmp::Reverse(a.len()));
        let alias_alt = aliases
            .iter()
            .map(|a| regex::escape(a))
            .collect::<Vec<_>>()
            .join("|");

        let rule = |task_type, verb: &str, target| -> Result<TaskRule> {
            Ok(TaskRule {
                task_type,
                verb: compile(&format!(r"(?i)\b(?:{verb})\b"))?,
                target,
            })
        };

        Ok(Self {
            default_hour: default_hour.min(23),
            sequence: compile(
                r"(?i)(?:\s*[,;]\s*|\s+)(?:and\s+)?(?:then|after\s+that|afterwards)[,\s]+",
            )?,
            rules: vec![
                rule("account_create", r"create|sign\s*up|register|make", Target::Platform)?,
                rule(
                    "data_scrape",
                    r"scrape|extract\s+(?:data|information)|collect\s+data|monitor",
                    Target::Url,
                )?,
                rule("browser_navigate", r"navigate\s+to|visit|open|go\s+to", Target::Url)?,
                rule(
                    "health_check",
                    r"monitor\s+(?:the\s+)?system|health\s*check|keep\s+(?:an\s+)?eye\s+on|watch\s+(?:for|the)",
                    Target::Nothing,
                )?,
                rule(
                    "cleanup",
                    r"clean\s*up|remove\s+(?:old|temporary)\s+files|delete\s+(?:old|temp)\s+data|maintenance",
                    Target::Nothing,
                )?,
            ],
            platform: compile(&format!(r"(?i)\b(?:{alias_alt})\b"))?,
            count: compile(r"(?i)\b(\d+)\s+(?:new\s+)?(?:[a-z.]+\s+)?accounts?\b")?,
            url: compile(r"(?i)\b(https?://[^\s,;]+|(?:[a-z0-9-]+\.)+[a-z]{2,}(?:/[^\s,;]*)?)")?,
            every_n: compile(r"(?i)\bevery\s+(\d+)\s+(second|sec|minute|min|hour|day|week)s?\b")?,
            twice_daily: compile(r"(?i)\btwice\s+(?:a\s+day|daily)\b")?,
            hourly: compile(r"(?i)\b(?:every\s+hour|each\s+hour|hourly)\b")?,
            weekday: compile(&format!(
                r"(?i)\b(?:every|each|on)\s+({})s?\b",
                WEEKDAYS.join("|")
            ))?,
            weekly: compile(r"(?i)\b(?:every\s+week|each\s+week|weekly)\b")?,
            monthly: compile(r"(?i)\b(?:every\s+month|each\s+month|monthly)\b")?,
            daily: compile(r"(?i)\b(?:every\s*day|each\s+day|daily)\b")?,
            time_of_day: compile(r"(?i)\bat\s+(\d{1,2})(?::(\d{2}))?\s*(am|pm)?\b")?,
        })
    }

    /// Synchronous extraction, shared with the model source's fallback.
    pub fn extract_tasks(&self, text: &str) -> Result<Vec<TaskSpec>> {
        let mut used_names = BTreeSet::new();
        let mut previous: Vec<String> = Vec::new();
        let mut tasks = Vec::new();

        for segment in self.sequence.split(text).map(str::trim).filter(|s| !s.is_empty()) {
            let trigger = self.schedule(segment);
            let mut current = Vec::new();

            for mut task in self.segment_tasks(segment, &mut used_names) {
                task.trigger = trigger.clone();
                if !previous.is_empty() {
                    task.depends_on = previous.iter().cloned().collect();
                    if task.trigger.is_none() {
                        task.trigger = Some(TriggerSpec::OnDependencySatisfied);
                    }
                }
                current.push(task.name.clone());
                tasks.push(task);
            }

            if !current.is_empty() {
                previous = current;
            }
        }
        Ok(tasks)
    }

    fn segment_tasks(&self, segment: &str, used_names: &mut BTreeSet<String>) -> Vec<TaskSpec> {
        let mut tasks = Vec::new();
        for rule in &self.rules {
            if !rule.verb.is_match(segment) {
                continue;
            }
            match rule.target {
                Target::Platform => {
                    let count = self
                        .count
                        .captures(segment)
                        .and_then(|c| c[1].parse::<u64>().ok());
                    for platform in self.platforms(segment) {
                        let mut task = TaskSpec::new(
                            &unique_name(&format!("{}_{platform}", rule.task_type), used_names),
                            rule.task_type,
                        )
                        .with_param("platform", platform);
                        if let Some(count) = count {
                            task = task.with_param("count", count);
                        }
                        tasks.push(task);
                    }
                }
                Target::Url => {
                    if let Some(url) = self.first_url(segment) {
                        tasks.push(
                            TaskSpec::new(&unique_name(rule.task_type, used_names), rule.task_type)
                                .with_param("url", url),
                        );
                    }
                }
                Target::Nothing => {
                    tasks.push(TaskSpec::new(
                        &unique_name(rule.task_type, used_names),
                        rule.task_type,
                    ));
                }
            }
        }
        tasks
    }

    /// Distinct canonical platforms, in order of first mention.
    fn platforms(&self, segment: &str) -> Vec<&'static str> {
        let mut found = Vec::new();
        for m in self.platform.find_iter(segment) {
            let alias = m.as_str().to_lowercase();
            let canonical = PLATFORMS
                .iter()
                .find(|(_, aliases)| aliases.contains(&alias.as_str()))
                .map(|(name, _)| *name);
            if let Some(name) = canonical
                && !found.contains(&name)
            {
                found.push(name);
            }
        }
        found
    }

    fn first_url(&self, segment: &str) -> Option<String> {
        let raw = self.url.find(segment)?.as_str();
        let url = raw.trim_end_matches(['.', ')', '!', '?', '\'', '"']);
        Some(if url.contains("://") {
            url.to_string()
        } else {
            format!("https://{url}")
        })
    }

    /// The single schedule a segment asks for, if any. Unreadable phrases
    /// are skipped, not fatal.
    fn schedule(&self, segment: &str) -> Option<TriggerSpec> {
        if let Some(c) = self.every_n.captures(segment) {
            let unit = match c[2].to_lowercase().as_str() {
                "second" | "sec" => 1,
                "minute" | "min" => 60,
                "hour" => 3600,
                "day" => 86_400,
                _ => 604_800,
            };
            match c[1].parse::<u64>().ok().and_then(|n| n.checked_mul(unit)) {
                Some(secs) => return Some(TriggerSpec::interval(secs)),
                None => tracing::debug!("Ignoring oversized interval \"{}\"", &c[0]),
            }
        }

        if self.hourly.is_match(segment) {
            return Some(TriggerSpec::cron("0 * * * *"));
        }

        let time = self.time_of_day(segment);
        let (hour, minute) = time.map(|(h, m, _)| (h, m)).unwrap_or((self.default_hour, 0));

        let expression = if self.twice_daily.is_match(segment) {
            let morning = hour % 12;
            format!("{minute} {morning},{} * * *", morning + 12)
        } else if let Some(c) = self.weekday.captures(segment) {
            let day = c[1].to_lowercase();
            let dow = WEEKDAYS.iter().position(|d| *d == day).unwrap_or(1);
            format!("{minute} {hour} * * {dow}")
        } else if self.weekly.is_match(segment) {
            format!("{minute} {hour} * * 1")
        } else if self.monthly.is_match(segment) {
            format!("{minute} {hour} 1 * *")
        } else if self.daily.is_match(segment) || time.is_some_and(|(_, _, explicit)| explicit) {
            format!("{minute} {hour} * * *")
        } else {
            return None;
        };
        Some(TriggerSpec::Cron { expression })
    }

    /// `(hour, minute, explicit)`. Explicit means it carried am/pm or minutes,
    /// so it can stand alone as "daily at". Out-of-range times read as absent.
    fn time_of_day(&self, segment: &str) -> Option<(u32, u32, bool)> {
        let c = self.time_of_day.captures(segment)?;
        let hour: u32 = c[1].parse().ok()?;
        let minute: u32 = match c.get(2) {
            Some(m) => m.as_str().parse().ok()?,
            None => 0,
        };
        let meridiem = c.get(3).map(|m| m.as_str().to_lowercase());
        let hour = match meridiem.as_deref() {
            Some(_) if !(1..=12).contains(&hour) => None,
            Some("am") => Some(hour % 12),
            Some(_) => Some(hour % 12 + 12),
            None if hour > 23 => None,
            None => Some(hour),
        };
        match hour {
            Some(hour) if minute <= 59 => Some((hour, minute, meridiem.is_some() || c.get(2).is_some())),
            _ => {
                tracing::debug!("Ignoring invalid time of day \"{}\"", c[0].trim());
                None
            }
        }
    }
}

fn unique_name(base: &str, used: &mut BTreeSet<String>) -> String {
    let mut name = base.to_string();
    let mut n = 2;
    while used.contains(&name) {
        name = format!("{base}_{n}");
        n += 1;
    }
    used.insert(name.clone());
    name
}

#[async_trait]
impl IntentSource for PatternSource {
    fn name(&self) -> &str {
        "pattern"
    }

    async fn extract(&self, text: &str) -> Result<Vec<TaskSpec>> {
        self.extract_tasks(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> PatternSource {
        PatternSource::new(9).unwrap()
    }

    fn one(text: &str) -> TaskSpec {
        let mut tasks = source().extract_tasks(text).unwrap();
        assert_eq!(tasks.len(), 1, "{text}: {tasks:?}");
        tasks.remove(0)
    }

    #[test]
    fn test_platform_aliases() {
        assert_eq!(one("sign up for insta").parameters["platform"], "instagram");
        assert_eq!(one("register on x.com").parameters["platform"], "twitter");
        assert_eq!(one("make a FB account").parameters["platform"], "facebook");
    }

    #[test]
    fn test_account_rule_needs_a_platform() {
        assert!(source().extract_tasks("create a report").unwrap().is_empty());
    }

    #[test]
    fn test_count_bound_to_noun_not_time() {
        let task = one("every 2 hours create 3 twitter accounts");
        assert_eq!(task.parameters["count"], 3);
        assert_eq!(task.trigger, Some(TriggerSpec::interval(7200)));

        let task = one("create 4 accounts on reddit at 10 pm");
        assert_eq!(task.parameters["count"], 4);
        assert_eq!(task.trigger, Some(TriggerSpec::cron("0 22 * * *")));
    }

    #[test]
    fn test_multiple_platforms_make_multiple_tasks() {
        let tasks = source()
            .extract_tasks("create accounts on twitter and instagram")
            .unwrap();
        let names: Vec<&str> = tasks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["account_create_twitter", "account_create_instagram"]);
    }

    #[test]
    fn test_scrape_and_navigate_urls() {
        let task = one("scrape data from https://example.com/products every 30 minutes.");
        assert_eq!(task.task_type, "data_scrape");
        assert_eq!(task.parameters["url"], "https://example.com/products");
        assert_eq!(task.trigger, Some(TriggerSpec::interval(1800)));

        let task = one("visit news.ycombinator.com weekly");
        assert_eq!(task.task_type, "browser_navigate");
        assert_eq!(task.parameters["url"], "https://news.ycombinator.com");
        assert_eq!(task.trigger, Some(TriggerSpec::cron("0 9 * * 1")));
    }

    #[test]
    fn test_monitor_without_url_is_health_check() {
        let task = one("monitor the system twice a day");
        assert_eq!(task.task_type, "health_check");
        assert_eq!(task.trigger, Some(TriggerSpec::cron("0 9,21 * * *")));
        assert_eq!(one("health check every hour").trigger, Some(TriggerSpec::cron("0 * * * *")));
    }

    #[test]
    fn test_weekday_monthly_and_time_override() {
        let task = one("every friday at 6pm clean up old files");
        assert_eq!(task.task_type, "cleanup");
        assert_eq!(task.trigger, Some(TriggerSpec::cron("0 18 * * 5")));

        assert_eq!(
            one("run maintenance every month").trigger,
            Some(TriggerSpec::cron("0 9 1 * *"))
        );
        assert_eq!(
            one("daily cleanup at 7:45").trigger,
            Some(TriggerSpec::cron("45 7 * * *"))
        );
        assert_eq!(
            one("at 12 am clean up").trigger,
            Some(TriggerSpec::cron("0 0 * * *"))
        );
    }

    #[test]
    fn test_bare_number_after_at_is_not_a_time() {
        let task = one("look at 5 sites and keep an eye on them");
        assert_eq!(task.task_type, "health_check");
        assert_eq!(task.trigger, None);
    }

    #[test]
    fn test_invalid_time_falls_back_to_default_hour() {
        let task = one("every day at 13pm clean up");
        assert_eq!(task.task_type, "cleanup");
        assert_eq!(task.trigger, Some(TriggerSpec::cron("0 9 * * *")));

        assert_eq!(
            one("every monday at 7:75 health check").trigger,
            Some(TriggerSpec::cron("0 9 * * 1"))
        );
        // No schedule keyword left once the time is dropped
        assert_eq!(one("clean up at 25:00").trigger, None);
    }

    #[test]
    fn test_oversized_interval_is_ignored() {
        let task = one("every 99999999999999999999 minutes health check");
        assert_eq!(task.task_type, "health_check");
        assert_eq!(task.trigger, None);

        assert_eq!(
            one("every 18446744073709551615 hours cleanup daily").trigger,
            Some(TriggerSpec::cron("0 9 * * *"))
        );
    }

    #[test]
    fn test_zero_interval_passes_through() {
        assert_eq!(
            one("health check every 0 seconds").trigger,
            Some(TriggerSpec::interval(0))
        );
    }

    #[test]
    fn test_sequencing_builds_dependencies() {
        let tasks = source()
            .extract_tasks(
                "create 2 reddit accounts then scrape data from https://reddit.com/r/rust, after that clean up",
            )
            .unwrap();
        let names: Vec<&str> = tasks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["account_create_reddit", "data_scrape", "cleanup"]);

        assert!(tasks[0].depends_on.is_empty());
        assert_eq!(tasks[0].trigger, None);
        assert!(tasks[1].depends_on.contains("account_create_reddit"));
        assert_eq!(tasks[1].trigger, Some(TriggerSpec::OnDependencySatisfied));
        assert_eq!(tasks[2].depends_on.iter().collect::<Vec<_>>(), vec!["data_scrape"]);
    }

    #[test]
    fn test_default_hour_applies() {
        let source = PatternSource::new(7).unwrap();
        let tasks = source.extract_tasks("daily cleanup").unwrap();
        assert_eq!(tasks[0].trigger, Some(TriggerSpec::cron("0 7 * * *")));
    }
}
