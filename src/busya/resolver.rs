#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::info;
use serde::Deserialize;

use crate::busya::phrases::{PhraseTable, RuleAction};

// ***************************************************************************
//                               Voice State
// ***************************************************************************
/** Which persona voice the server reports.  Shared by every request; starts
 * as the female voice.
 */
#[derive(Debug, Default)]
pub struct VoiceState {
    is_male: AtomicBool,
}

impl VoiceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_male(&self) -> bool {
        self.is_male.load(Ordering::SeqCst)
    }

    /// Flip the voice and return the new value.
    pub fn toggle(&self) -> bool {
        !self.is_male.fetch_xor(true, Ordering::SeqCst)
    }
}

// ***************************************************************************
//                               Match Mode
// ***************************************************************************
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// A trigger matches anywhere in the query, even inside a word.
    #[default]
    Substring,
    /// A trigger's words must appear as a contiguous run of whole words.
    Tokenized,
}

// ***************************************************************************
//                            Response Resolver
// ***************************************************************************
#[derive(Debug)]
pub struct ResponseResolver {
    table: PhraseTable,
    mode: MatchMode,
    voice: Arc<VoiceState>,
}

impl ResponseResolver {
    pub fn new(table: PhraseTable, mode: MatchMode, voice: Arc<VoiceState>) -> Self {
        Self {table, mode, voice}
    }

    pub fn voice(&self) -> &VoiceState {
        &self.voice
    }

    // -----------------------------------------------------------------------
    // resolve:
    // -----------------------------------------------------------------------
    /** Return the canned reply for the query, or None when the query should
     * go to the completion provider.  Rules are tried in table order and the
     * first rule with a matching trigger wins.  A voice toggle rule flips the
     * shared voice state as a side effect.
     */
    pub fn resolve(&self, query: &str) -> Option<String> {
        let q = query.trim().to_lowercase();
        let q_words = match self.mode {
            MatchMode::Substring => Vec::new(),
            MatchMode::Tokenized => words(&q),
        };

        let rule = self.table.rules().iter().find(|rule| {
            rule.triggers.iter().any(|t| self.matches(&q, &q_words, t))
        })?;

        match &rule.action {
            RuleAction::ToggleVoice {male, female} => {
                let is_male = self.voice.toggle();
                info!("Voice switched to {}.", if is_male {"male"} else {"female"});
                Some(if is_male {male.clone()} else {female.clone()})
            }
            RuleAction::Reply {text} => Some(text.clone()),
        }
    }

    fn matches(&self, q: &str, q_words: &[&str], trigger: &str) -> bool {
        match self.mode {
            MatchMode::Substring => q.contains(trigger),
            MatchMode::Tokenized => {
                let t_words = words(trigger);
                !t_words.is_empty() && q_words.windows(t_words.len()).any(|w| w == t_words.as_slice())
            }
        }
    }
}

// Split on anything that isn't a letter or digit.
fn words(s: &str) -> Vec<&str> {
    s.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()).collect()
}

// ***************************************************************************
//                                  Tests
// ***************************************************************************
#[cfg(test)]
mod tests {
    use super::*;
    use crate::busya::phrases::PhraseRule;

    fn resolver(mode: MatchMode) -> ResponseResolver {
        ResponseResolver::new(PhraseTable::default(), mode, Arc::new(VoiceState::new()))
    }

    fn creation_story() -> String {
        match &PhraseTable::default().rules()[1].action {
            RuleAction::Reply {text} => text.clone(),
            _ => unreachable!(),
        }
    }

    #[test]
    fn voice_starts_female_and_toggles() {
        let voice = VoiceState::new();
        assert!(!voice.is_male());
        assert!(voice.toggle());
        assert!(voice.is_male());
        assert!(!voice.toggle());
        assert!(!voice.is_male());
    }

    #[test]
    fn who_are_you_gets_creation_story() {
        let r = resolver(MatchMode::Substring);
        assert_eq!(r.resolve("Кто ты?"), Some(creation_story()));
        assert_eq!(r.resolve("  РАССКАЖИ О СЕБЕ пожалуйста "), Some(creation_story()));
    }

    #[test]
    fn voice_toggle_alternates() {
        let r = resolver(MatchMode::Substring);
        let first = r.resolve("смени голос").unwrap();
        assert!(first.contains("мужской"));
        assert!(r.voice().is_male());

        let second = r.resolve("Смени голос!").unwrap();
        assert!(second.contains("женский"));
        assert!(!r.voice().is_male());
    }

    #[test]
    fn canned_replies_are_stable() {
        let r = resolver(MatchMode::Substring);
        let a = r.resolve("а кто такая Малика?");
        let b = r.resolve("кто такая малика");
        assert!(a.is_some());
        assert_eq!(a, b);
        assert!(!r.voice().is_male());

        let p = r.resolve("где она живёт?").unwrap();
        assert!(p.contains("личную информацию"));
    }

    #[test]
    fn voice_rule_has_priority() {
        let r = resolver(MatchMode::Substring);
        let reply = r.resolve("кто ты? смени голос").unwrap();
        assert!(reply.contains("мужской"));
        assert!(r.voice().is_male());
    }

    #[test]
    fn no_match_defers() {
        let r = resolver(MatchMode::Substring);
        assert_eq!(r.resolve("hello"), None);
        assert_eq!(r.resolve("как дела?"), None);
        assert!(!r.voice().is_male());
    }

    #[test]
    fn substring_matches_inside_words() {
        let r = resolver(MatchMode::Substring);
        assert_eq!(r.resolve("кто тыкву съел?"), Some(creation_story()));
    }

    #[test]
    fn tokenized_requires_whole_words() {
        let r = resolver(MatchMode::Tokenized);
        assert_eq!(r.resolve("кто тыкву съел?"), None);
        assert_eq!(r.resolve("Ну, кто ты?"), Some(creation_story()));
        assert!(r.resolve("смени, голос").is_some());
        assert!(r.voice().is_male());
    }

    #[test]
    fn custom_table() {
        let table = PhraseTable::new(vec![
            PhraseRule::new(&["Ping"], RuleAction::Reply {text: "pong".to_string()}),
        ]).unwrap();
        let r = ResponseResolver::new(table, MatchMode::Substring, Arc::new(VoiceState::new()));
        assert_eq!(r.resolve("PING?"), Some("pong".to_string()));
        assert_eq!(r.resolve("кто ты"), None);
    }

    #[test]
    fn concurrent_toggles_keep_parity() {
        for count in [100, 101] {
            let voice = Arc::new(VoiceState::new());
            std::thread::scope(|s| {
                for _ in 0..count {
                    let voice = voice.clone();
                    s.spawn(move || { voice.toggle(); });
                }
            });
            assert_eq!(voice.is_male(), count % 2 == 1, "after {} toggles", count);
        }
    }
}
