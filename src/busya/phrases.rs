#![forbid(unsafe_code)]

use serde::Deserialize;
use thiserror::Error;

// ***************************************************************************
//                                Constants
// ***************************************************************************
// Built-in persona text.
const CREATION_STORY: &str = "Приветик! Я — Busya-AI, создана самой Расуловой Маликой — busyaaa_1! 💖 \
    Это её мечта — ИИ с душой и стилем. Подписывайся: https://github.com/busyaaa1";
const ABOUT_MALIKA: &str = "Меня создала Малика — busyaaa_1. Она — огонь! 🔥 Связаться можно в Instagram: @busyaaa_1";
const PRIVACY_WARNING: &str = "Извини, солнышко, личную информацию не разглашаю 🌸. Напиши Малике в Instagram: @busyaaa_1";
const VOICE_CHANGE_MALE: &str = "Хорошо, переключаюсь на мужской голос 🧑‍💻";
const VOICE_CHANGE_FEMALE: &str = "Хорошо, теперь женский голос 👩‍🎤";

// ***************************************************************************
//                                 Errors
// ***************************************************************************
#[derive(Error, Debug)]
pub enum PhraseError {
    #[error("unable to parse phrase table: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("phrase rule {0} has no usable triggers")]
    NoTriggers(usize),
}

// ***************************************************************************
//                               Phrase Rules
// ***************************************************************************
/// What a rule does once one of its triggers is found in a query.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleAction {
    /// Flip the voice state and answer with the text for the new voice.
    ToggleVoice { male: String, female: String },
    /// Answer with fixed text.
    Reply { text: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PhraseRule {
    pub triggers: Vec<String>,
    pub action: RuleAction,
}

impl PhraseRule {
    pub fn new(triggers: &[&str], action: RuleAction) -> Self {
        Self {triggers: triggers.iter().map(|t| t.to_string()).collect(), action}
    }

    fn reply(triggers: &[&str], text: &str) -> Self {
        Self::new(triggers, RuleAction::Reply {text: text.to_string()})
    }
}

// ***************************************************************************
//                               Phrase Table
// ***************************************************************************
/** The ordered canned-response rules.  Earlier rules take priority.  Triggers
 * are stored lowercased and trimmed so they compare against normalized queries.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhraseTable {
    rules: Vec<PhraseRule>,
}

// File layout only; every table goes through PhraseTable::new.
#[derive(Deserialize)]
struct PhraseFile {
    rules: Vec<PhraseRule>,
}

impl PhraseTable {
    pub fn new(rules: Vec<PhraseRule>) -> Result<Self, PhraseError> {
        let mut rules = rules;
        for (i, rule) in rules.iter_mut().enumerate() {
            rule.triggers = rule.triggers.iter()
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect();
            if rule.triggers.is_empty() {
                return Err(PhraseError::NoTriggers(i));
            }
        }
        Ok(Self {rules})
    }

    /** Parse a table from toml of the form:
     *
     *   [[rules]]
     *   triggers = ["кто ты"]
     *   action = { kind = "reply", text = "..." }
     */
    pub fn from_toml(contents: &str) -> Result<Self, PhraseError> {
        let raw: PhraseFile = toml::from_str(contents)?;
        Self::new(raw.rules)
    }

    pub fn rules(&self) -> &[PhraseRule] {
        &self.rules
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

impl Default for PhraseTable {
    fn default() -> Self {
        Self {rules: vec![
            PhraseRule::new(&["смени голос", "поменяй голос"],
                RuleAction::ToggleVoice {
                    male: VOICE_CHANGE_MALE.to_string(),
                    female: VOICE_CHANGE_FEMALE.to_string(),
                }),
            PhraseRule::reply(&["кто тебя создала", "расскажи о себе", "кто ты"], CREATION_STORY),
            PhraseRule::reply(&["кто такая малика"], ABOUT_MALIKA),
            PhraseRule::reply(&["сколько ей лет", "где она живёт"], PRIVACY_WARNING),
        ]}
    }
}
