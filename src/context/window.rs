//! Conversation Window Selection
//!
//! Picks the part of a conversation history that fits a model's token limit,
//! leaving room for the reply. Admission is greedy and newest-first: the walk
//! stops at the first message that would overflow, it never skips ahead to a
//! smaller, older one.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::info;

use super::tokens::TokenCounter;

/// Speaker of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One conversation turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }
}

/// How the history is trimmed to fit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SelectionPolicy {
    /// Longest run of newest messages that fits
    #[default]
    Default,
    /// The opening message is reserved first, then the newest messages fill the rest
    IncludeFirstPrompt,
}

impl SelectionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionPolicy::Default => "default",
            SelectionPolicy::IncludeFirstPrompt => "includeFirstPrompt",
        }
    }

    /// Lenient parse for configuration values: anything unrecognized is `Default`.
    pub fn from_config(value: Option<&str>) -> Self {
        value
            .and_then(|v| v.parse().ok())
            .unwrap_or_default()
    }
}

impl fmt::Display for SelectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "default" => Ok(SelectionPolicy::Default),
            "includeFirstPrompt" => Ok(SelectionPolicy::IncludeFirstPrompt),
            other => Err(format!("unknown selection policy: {}", other)),
        }
    }
}

/// Token budget for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Budget {
    /// Tokens already spent on the system prompt
    pub base_tokens: u32,
    /// Hard ceiling of the target model
    pub token_limit: u32,
    /// Tokens left free for the reply
    pub reserved_generation: u32,
}

impl Budget {
    pub fn new(base_tokens: u32, token_limit: u32, reserved_generation: u32) -> Self {
        Self {
            base_tokens,
            token_limit,
            reserved_generation,
        }
    }

    /// Whether a message costing `cost` can be admitted on top of `running`
    pub fn fits(&self, running: u32, cost: u32) -> bool {
        running as u64 + cost as u64 + self.reserved_generation as u64 <= self.token_limit as u64
    }

    /// Tokens left for history before any message is admitted
    pub fn available(&self) -> u32 {
        self.token_limit
            .saturating_sub(self.base_tokens)
            .saturating_sub(self.reserved_generation)
    }
}

/// Messages chosen for one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowSelection {
    /// Selected messages in conversation order
    pub messages: Vec<Message>,
    /// Base tokens plus the cost of every selected message
    pub running_total: u32,
    pub token_limit: u32,
}

impl WindowSelection {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// How many messages of a history of `history_len` were left out
    pub fn dropped(&self, history_len: usize) -> usize {
        history_len.saturating_sub(self.messages.len())
    }
}

/// Select the messages of `history` (oldest first) that fit `budget`.
///
/// Never fails: an empty history, a zero limit or an oversized message all
/// just produce a smaller, possibly empty, selection.
pub fn select_window(
    history: &[Message],
    budget: Budget,
    policy: SelectionPolicy,
    counter: &dyn TokenCounter,
) -> WindowSelection {
    let (messages, running_total) = match policy {
        SelectionPolicy::Default => walk_newest_first(history, budget, budget.base_tokens, counter),
        SelectionPolicy::IncludeFirstPrompt => include_first_prompt(history, budget, counter),
    };

    info!(
        running_total,
        token_limit = budget.token_limit,
        policy = %policy,
        selected = messages.len(),
        history_len = history.len(),
        "Tokens: {}/{}",
        running_total,
        budget.token_limit
    );

    WindowSelection {
        messages,
        running_total,
        token_limit: budget.token_limit,
    }
}

/// Greedy walk from the newest message back, halting at the first overflow.
/// Returns the kept messages in conversation order and the new running total.
fn walk_newest_first(
    history: &[Message],
    budget: Budget,
    mut running: u32,
    counter: &dyn TokenCounter,
) -> (Vec<Message>, u32) {
    let mut start = history.len();
    for (index, message) in history.iter().enumerate().rev() {
        let cost = counter.count(&message.content);
        if !budget.fits(running, cost) {
            break;
        }
        // fits() bounds running + cost by token_limit
        running += cost;
        start = index;
    }
    (history[start..].to_vec(), running)
}

fn include_first_prompt(
    history: &[Message],
    budget: Budget,
    counter: &dyn TokenCounter,
) -> (Vec<Message>, u32) {
    let Some((first, rest)) = history.split_first() else {
        return (Vec::new(), budget.base_tokens);
    };

    let first_cost = counter.count(&first.content);
    if !budget.fits(budget.base_tokens, first_cost) {
        // No fallback to the plain walk: the whole selection is given up.
        return (Vec::new(), budget.base_tokens);
    }

    let (tail, running) = walk_newest_first(rest, budget, budget.base_tokens + first_cost, counter);
    let mut messages = Vec::with_capacity(tail.len() + 1);
    messages.push(first.clone());
    messages.extend(tail);
    (messages, running)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    /// Messages whose content is their own token cost, counted by `parse_cost`
    fn history_of(costs: &[u32]) -> Vec<Message> {
        costs
            .iter()
            .enumerate()
            .map(|(i, cost)| {
                let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
                Message::new(role, format!("{}:{}", i, cost))
            })
            .collect()
    }

    fn parse_cost(text: &str) -> u32 {
        text.rsplit(':').next().and_then(|c| c.parse().ok()).unwrap_or(0)
    }

    fn select(costs: &[u32], budget: Budget, policy: SelectionPolicy) -> (Vec<Message>, WindowSelection) {
        let history = history_of(costs);
        let selection = select_window(&history, budget, policy, &parse_cost);
        (history, selection)
    }

    #[test]
    fn test_default_keeps_newest_that_fit() {
        // 10 + 15 + 20 = 45 kept; 45 + 30 + 35 = 110 > 100 stops the walk
        let (history, selection) = select(&[30, 20, 15], Budget::new(10, 100, 35), SelectionPolicy::Default);
        assert_eq!(selection.messages, history[1..].to_vec());
        assert_eq!(selection.running_total, 45);
        assert_eq!(selection.token_limit, 100);
        assert_eq!(selection.dropped(history.len()), 1);
    }

    #[test]
    fn test_include_first_prompt_reserves_opening_turn() {
        // 10 + 30 + 35 = 75 reserves the opening turn; 15 fits (55),
        // then 55 + 20 + 35 = 110 > 100 stops the walk
        let (history, selection) = select(
            &[30, 20, 15],
            Budget::new(10, 100, 35),
            SelectionPolicy::IncludeFirstPrompt,
        );
        assert_eq!(selection.messages, vec![history[0].clone(), history[2].clone()]);
        assert_eq!(selection.running_total, 55);
    }

    #[test]
    fn test_reserve_is_not_accumulated_into_running_total() {
        // Each admission checks running + cost + reserve; only cost is added,
        // so with a 20-token reserve all three messages fit under both policies.
        for policy in [SelectionPolicy::Default, SelectionPolicy::IncludeFirstPrompt] {
            let (history, selection) = select(&[30, 20, 15], Budget::new(10, 100, 20), policy);
            assert_eq!(selection.messages, history);
            assert_eq!(selection.running_total, 75);
        }
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(std::sync::Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    #[test]
    fn test_logs_running_total_against_limit() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .without_time()
            .finish();

        let history = history_of(&[30, 20, 15]);
        let selection = tracing::subscriber::with_default(subscriber, || {
            select_window(&history, Budget::new(10, 100, 35), SelectionPolicy::Default, &parse_cost)
        });
        assert_eq!(selection.running_total, 45);

        let output = logs.contents();
        assert!(output.contains("Tokens: 45/100"), "{}", output);
        assert!(output.contains("running_total=45"), "{}", output);
        assert!(output.contains("token_limit=100"), "{}", output);
        assert!(output.contains("policy=default"), "{}", output);
    }

    #[test]
    fn test_include_first_prompt_gives_up_when_opening_turn_is_too_large() {
        // Surprising but intended: small later messages are dropped too,
        // there is no fallback to the default walk.
        let (_, selection) = select(
            &[95, 1, 1, 1],
            Budget::new(10, 100, 20),
            SelectionPolicy::IncludeFirstPrompt,
        );
        assert!(selection.is_empty());
        assert_eq!(selection.running_total, 10);

        let (_, fallback) = select(&[95, 1, 1, 1], Budget::new(10, 100, 20), SelectionPolicy::Default);
        assert_eq!(fallback.len(), 3);
    }

    #[test]
    fn test_oversized_newest_message_selects_nothing() {
        let (_, selection) = select(&[200], Budget::new(0, 100, 20), SelectionPolicy::Default);
        assert!(selection.is_empty());
        assert_eq!(selection.running_total, 0);
    }

    #[test]
    fn test_walk_halts_instead_of_skipping() {
        // The 5-token message would fit but sits behind a rejected one
        let (history, selection) = select(&[5, 90, 10], Budget::new(0, 50, 10), SelectionPolicy::Default);
        assert_eq!(selection.messages, vec![history[2].clone()]);
    }

    #[test]
    fn test_empty_history() {
        for policy in [SelectionPolicy::Default, SelectionPolicy::IncludeFirstPrompt] {
            let selection = select_window(&[], Budget::new(7, 100, 20), policy, &parse_cost);
            assert!(selection.is_empty());
            assert_eq!(selection.running_total, 7);
        }
    }

    #[test]
    fn test_zero_limit_selects_nothing() {
        let (_, selection) = select(&[0, 0], Budget::new(0, 0, 1), SelectionPolicy::Default);
        assert!(selection.is_empty());
    }

    #[test]
    fn test_exact_fit_is_admitted() {
        let (history, selection) = select(&[40, 40], Budget::new(0, 100, 20), SelectionPolicy::Default);
        assert_eq!(selection.messages, history);
        assert_eq!(selection.running_total, 80);
    }

    #[test]
    fn test_include_first_prompt_single_message() {
        let (history, selection) = select(&[10], Budget::new(0, 100, 20), SelectionPolicy::IncludeFirstPrompt);
        assert_eq!(selection.messages, history);
    }

    #[test]
    fn test_budget_arithmetic_does_not_overflow() {
        let budget = Budget::new(u32::MAX, u32::MAX, u32::MAX);
        assert!(!budget.fits(u32::MAX, u32::MAX));
        assert_eq!(budget.available(), 0);
        assert_eq!(Budget::new(10, 100, 20).available(), 70);
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("default".parse::<SelectionPolicy>(), Ok(SelectionPolicy::Default));
        assert_eq!(
            "includeFirstPrompt".parse::<SelectionPolicy>(),
            Ok(SelectionPolicy::IncludeFirstPrompt)
        );
        assert!("everything".parse::<SelectionPolicy>().is_err());
        assert_eq!(SelectionPolicy::from_config(Some("everything")), SelectionPolicy::Default);
        assert_eq!(SelectionPolicy::from_config(None), SelectionPolicy::Default);
        assert_eq!(
            serde_json::to_string(&SelectionPolicy::IncludeFirstPrompt).unwrap(),
            "\"includeFirstPrompt\""
        );
    }

    #[test]
    fn test_message_json_shape() {
        let message: Message = serde_json::from_str(r#"{"role":"assistant","content":"hi"}"#).unwrap();
        assert_eq!(message, Message::assistant("hi"));
    }

    fn cost_lists() -> impl Strategy<Value = Vec<u32>> {
        prop::collection::vec(0u32..60, 0..24)
    }

    fn any_budget() -> impl Strategy<Value = Budget> {
        (0u32..80, 1u32..400, 0u32..80).prop_map(|(base, limit, reserved)| Budget::new(base, limit, reserved))
    }

    fn total_cost(messages: &[Message]) -> u64 {
        messages.iter().map(|m| parse_cost(&m.content) as u64).sum()
    }

    proptest! {
        /// A non-empty selection always leaves the reserved generation free.
        #[test]
        fn selection_respects_budget(costs in cost_lists(), budget in any_budget()) {
            for policy in [SelectionPolicy::Default, SelectionPolicy::IncludeFirstPrompt] {
                let (_, selection) = select(&costs, budget, policy);
                if !selection.is_empty() {
                    let used = budget.base_tokens as u64 + total_cost(&selection.messages)
                        + budget.reserved_generation as u64;
                    prop_assert!(used <= budget.token_limit as u64);
                }
                prop_assert_eq!(
                    selection.running_total as u64,
                    budget.base_tokens as u64 + total_cost(&selection.messages)
                );
            }
        }

        /// Default selection is a contiguous suffix, and the message just
        /// before it (if any) is the one that did not fit.
        #[test]
        fn default_selection_is_maximal_suffix(costs in cost_lists(), budget in any_budget()) {
            let (history, selection) = select(&costs, budget, SelectionPolicy::Default);
            let start = history.len() - selection.len();
            prop_assert_eq!(&selection.messages[..], &history[start..]);
            if start > 0 {
                let next = parse_cost(&history[start - 1].content);
                prop_assert!(!budget.fits(selection.running_total, next));
            }
        }

        /// First-prompt selection is the opening message plus a suffix of the rest.
        #[test]
        fn first_prompt_selection_shape(costs in cost_lists(), budget in any_budget()) {
            let (history, selection) = select(&costs, budget, SelectionPolicy::IncludeFirstPrompt);
            if let Some((first, rest)) = selection.messages.split_first() {
                prop_assert_eq!(first, &history[0]);
                let start = history.len() - rest.len();
                prop_assert!(start >= 1);
                prop_assert_eq!(rest, &history[start..]);
            } else if let Some(first) = history.first() {
                // Empty only when the opening message alone overflows
                prop_assert!(!budget.fits(budget.base_tokens, parse_cost(&first.content)));
            }
        }
    }
}
