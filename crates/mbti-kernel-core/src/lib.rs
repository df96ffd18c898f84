use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Duration, OffsetDateTime, UtcOffset};

pub mod content;

pub use content::{ContentCache, ContentSource, MapContentSource, TypeContent};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KernelError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("content error: {0}")]
    Content(String),
}

/// One of the eight preference letters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Preference {
    E,
    I,
    S,
    N,
    T,
    F,
    J,
    P,
}

impl Preference {
    pub const ALL: [Self; 8] = [
        Self::E,
        Self::I,
        Self::S,
        Self::N,
        Self::T,
        Self::F,
        Self::J,
        Self::P,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::E => "E",
            Self::I => "I",
            Self::S => "S",
            Self::N => "N",
            Self::T => "T",
            Self::F => "F",
            Self::J => "J",
            Self::P => "P",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "E" => Some(Self::E),
            "I" => Some(Self::I),
            "S" => Some(Self::S),
            "N" => Some(Self::N),
            "T" => Some(Self::T),
            "F" => Some(Self::F),
            "J" => Some(Self::J),
            "P" => Some(Self::P),
            _ => None,
        }
    }

    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Self::E => Self::I,
            Self::I => Self::E,
            Self::S => Self::N,
            Self::N => Self::S,
            Self::T => Self::F,
            Self::F => Self::T,
            Self::J => Self::P,
            Self::P => Self::J,
        }
    }

    #[must_use]
    pub fn pair(self) -> TraitPair {
        match self {
            Self::E | Self::I => TraitPair::EI,
            Self::S | Self::N => TraitPair::SN,
            Self::T | Self::F => TraitPair::TF,
            Self::J | Self::P => TraitPair::JP,
        }
    }
}

impl Display for Preference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The four opposing dichotomies, in canonical type-code order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum TraitPair {
    #[serde(rename = "E/I")]
    EI,
    #[serde(rename = "S/N")]
    SN,
    #[serde(rename = "T/F")]
    TF,
    #[serde(rename = "J/P")]
    JP,
}

impl TraitPair {
    pub const ALL: [Self; 4] = [Self::EI, Self::SN, Self::TF, Self::JP];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EI => "E/I",
            Self::SN => "S/N",
            Self::TF => "T/F",
            Self::JP => "J/P",
        }
    }

    #[must_use]
    pub fn left(self) -> Preference {
        match self {
            Self::EI => Preference::E,
            Self::SN => Preference::S,
            Self::TF => Preference::T,
            Self::JP => Preference::J,
        }
    }

    #[must_use]
    pub fn right(self) -> Preference {
        self.left().opposite()
    }

    #[must_use]
    pub fn contains(self, preference: Preference) -> bool {
        preference.pair() == self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Choice {
    pub value: Preference,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Question {
    #[serde(default, alias = "questionText")]
    pub question: String,
    #[serde(alias = "choiceA")]
    pub choice_a: Choice,
    #[serde(alias = "choiceB")]
    pub choice_b: Choice,
}

impl Question {
    #[must_use]
    pub fn pair(&self) -> TraitPair {
        self.choice_a.value.pair()
    }

    #[must_use]
    pub fn touches(&self, pair: TraitPair) -> bool {
        pair.contains(self.choice_a.value) || pair.contains(self.choice_b.value)
    }

    /// Checks that both choices are the two opposite letters of one pair.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when the choices mix pairs or
    /// repeat the same letter.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.choice_b.value != self.choice_a.value.opposite() {
            return Err(KernelError::Validation(format!(
                "choices MUST be opposite letters of one pair, got {} and {}",
                self.choice_a.value, self.choice_b.value
            )));
        }
        Ok(())
    }
}

/// Ordered question list; an answer refers to a question by its index.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct QuestionCatalog {
    questions: Vec<Question>,
}

impl QuestionCatalog {
    /// Builds a catalog after validating every question.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] naming the first invalid question.
    pub fn new(questions: Vec<Question>) -> Result<Self, KernelError> {
        let catalog = Self { questions };
        catalog.validate()?;
        Ok(catalog)
    }

    /// # Errors
    /// Returns [`KernelError::Validation`] naming the first invalid question.
    pub fn validate(&self) -> Result<(), KernelError> {
        for (index, question) in self.questions.iter().enumerate() {
            question.validate().map_err(|err| {
                KernelError::Validation(format!("question {index}: {err}"))
            })?;
        }
        Ok(())
    }

    /// Decodes and validates a catalog from a JSON array.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when decoding fails or a question
    /// violates the pair invariant.
    pub fn from_json(value: &Value) -> Result<Self, KernelError> {
        let questions: Vec<Question> = serde_json::from_value(value.clone()).map_err(|err| {
            KernelError::Validation(format!("invalid question catalog JSON payload: {err}"))
        })?;
        Self::new(questions)
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Question> {
        self.questions.get(index)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.questions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Question> {
        self.questions.iter()
    }

    /// Counts questions where either choice slot uses a letter of `pair`.
    #[must_use]
    pub fn questions_in_pair(&self, pair: TraitPair) -> usize {
        self.questions
            .iter()
            .filter(|question| question.touches(pair))
            .count()
    }
}

/// The five response options offered for every question.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AnswerOption {
    StronglyA,
    SomewhatA,
    Neutral,
    SomewhatB,
    StronglyB,
}

impl AnswerOption {
    pub const ALL: [Self; 5] = [
        Self::StronglyA,
        Self::SomewhatA,
        Self::Neutral,
        Self::SomewhatB,
        Self::StronglyB,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StronglyA => "strongly_a",
            Self::SomewhatA => "somewhat_a",
            Self::Neutral => "neutral",
            Self::SomewhatB => "somewhat_b",
            Self::StronglyB => "strongly_b",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "strongly_a" => Some(Self::StronglyA),
            "somewhat_a" => Some(Self::SomewhatA),
            "neutral" => Some(Self::Neutral),
            "somewhat_b" => Some(Self::SomewhatB),
            "strongly_b" => Some(Self::StronglyB),
            _ => None,
        }
    }

    #[must_use]
    pub fn weight(self) -> f64 {
        match self {
            Self::StronglyA => 1.0,
            Self::SomewhatA => 0.75,
            Self::Neutral => 0.5,
            Self::SomewhatB => 0.25,
            Self::StronglyB => 0.0,
        }
    }

    /// Maps a stored weight back to the option that produced it.
    #[must_use]
    pub fn from_weight(weight: f64) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|option| (option.weight() - weight).abs() < WEIGHT_EPSILON)
    }
}

const WEIGHT_EPSILON: f64 = 1e-9;

/// A graded response. `weight` always measures leaning toward the question's
/// choice A; `value` records the letter the respondent picked and does not
/// take part in scoring.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", try_from = "AnswerRecord")]
pub struct Answer {
    pub question_id: usize,
    pub value: Preference,
    pub weight: f64,
}

impl Answer {
    /// # Errors
    /// Returns [`KernelError::Validation`] when `weight` is not a finite
    /// number in `[0.0, 1.0]`.
    pub fn new(question_id: usize, value: Preference, weight: f64) -> Result<Self, KernelError> {
        if !weight.is_finite() || !(0.0..=1.0).contains(&weight) {
            return Err(KernelError::Validation(
                "weight MUST be in [0.0, 1.0]".to_string(),
            ));
        }
        Ok(Self {
            question_id,
            value,
            weight,
        })
    }

    #[must_use]
    pub fn from_option(question_id: usize, question: &Question, option: AnswerOption) -> Self {
        let value = match option {
            AnswerOption::StronglyA | AnswerOption::SomewhatA | AnswerOption::Neutral => {
                question.choice_a.value
            }
            AnswerOption::SomewhatB | AnswerOption::StronglyB => question.choice_b.value,
        };
        Self {
            question_id,
            value,
            weight: option.weight(),
        }
    }
}

/// Wire shapes accepted for a stored answer. Records written before graded
/// options existed carry no weight.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum AnswerRecord {
    Weighted {
        #[serde(rename = "questionId")]
        question_id: usize,
        value: Preference,
        weight: f64,
    },
    Legacy {
        #[serde(rename = "questionId")]
        question_id: usize,
        value: Preference,
    },
}

pub const LEGACY_WEIGHT: f64 = 1.0;

impl TryFrom<AnswerRecord> for Answer {
    type Error = KernelError;

    fn try_from(record: AnswerRecord) -> Result<Self, Self::Error> {
        match record {
            AnswerRecord::Weighted {
                question_id,
                value,
                weight,
            } => Self::new(question_id, value, weight),
            AnswerRecord::Legacy { question_id, value } => {
                Self::new(question_id, value, LEGACY_WEIGHT)
            }
        }
    }
}

/// Records `answer`, replacing in place any earlier answer for the same
/// question.
pub fn upsert_answer(answers: &mut Vec<Answer>, answer: Answer) {
    match answers
        .iter_mut()
        .find(|existing| existing.question_id == answer.question_id)
    {
        Some(existing) => *existing = answer,
        None => answers.push(answer),
    }
}

/// Per-letter accumulated score.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct TraitScores(BTreeMap<Preference, f64>);

impl TraitScores {
    #[must_use]
    pub fn new() -> Self {
        Self(
            Preference::ALL
                .into_iter()
                .map(|preference| (preference, 0.0))
                .collect(),
        )
    }

    #[must_use]
    pub fn from_values(values: impl IntoIterator<Item = (Preference, f64)>) -> Self {
        let mut scores = Self::new();
        for (preference, value) in values {
            scores.0.insert(preference, value);
        }
        scores
    }

    #[must_use]
    pub fn get(&self, preference: Preference) -> f64 {
        self.0.get(&preference).copied().unwrap_or(0.0)
    }

    pub fn add(&mut self, preference: Preference, amount: f64) {
        *self.0.entry(preference).or_insert(0.0) += amount;
    }

    #[must_use]
    pub fn total(&self) -> f64 {
        self.0.values().sum()
    }

    /// Left-biased winner of one pair; ties go to the left letter.
    #[must_use]
    pub fn dominant(&self, pair: TraitPair) -> Preference {
        if self.get(pair.left()) >= self.get(pair.right()) {
            pair.left()
        } else {
            pair.right()
        }
    }
}

impl Default for TraitScores {
    fn default() -> Self {
        Self::new()
    }
}

pub const ALL_TYPE_CODES: [&str; 16] = [
    "INTJ", "INTP", "ENTJ", "ENTP", "INFJ", "INFP", "ENFJ", "ENFP", "ISTJ", "ISFJ", "ESTJ",
    "ESFJ", "ISTP", "ISFP", "ESTP", "ESFP",
];

pub const POPULAR_TYPE_CODES: [&str; 6] = ["INTJ", "INFP", "ENFP", "INTP", "INFJ", "ENTJ"];

/// Four-letter classification, one letter per pair in canonical order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct TypeCode([Preference; 4]);

impl TypeCode {
    /// # Errors
    /// Returns [`KernelError::Validation`] unless `value` is four letters,
    /// each drawn from the matching pair in E/I, S/N, T/F, J/P order.
    pub fn parse(value: &str) -> Result<Self, KernelError> {
        let invalid = || KernelError::Validation(format!("invalid type code: {value:?}"));

        let chars: Vec<char> = value.chars().collect();
        if chars.len() != TraitPair::ALL.len() {
            return Err(invalid());
        }

        let mut letters = [Preference::E; 4];
        for ((slot, pair), ch) in letters.iter_mut().zip(TraitPair::ALL).zip(chars) {
            let preference = Preference::parse(&ch.to_string()).ok_or_else(invalid)?;
            if !pair.contains(preference) {
                return Err(invalid());
            }
            *slot = preference;
        }

        Ok(Self(letters))
    }

    #[must_use]
    pub fn letters(self) -> [Preference; 4] {
        self.0
    }

    #[must_use]
    pub fn letter(self, pair: TraitPair) -> Preference {
        match pair {
            TraitPair::EI => self.0[0],
            TraitPair::SN => self.0[1],
            TraitPair::TF => self.0[2],
            TraitPair::JP => self.0[3],
        }
    }

    #[must_use]
    pub fn all() -> Vec<Self> {
        ALL_TYPE_CODES
            .iter()
            .filter_map(|raw| Self::parse(raw).ok())
            .collect()
    }

    #[must_use]
    pub fn popular() -> Vec<Self> {
        POPULAR_TYPE_CODES
            .iter()
            .filter_map(|raw| Self::parse(raw).ok())
            .collect()
    }
}

impl Display for TypeCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for letter in self.0 {
            f.write_str(letter.as_str())?;
        }
        Ok(())
    }
}

impl FromStr for TypeCode {
    type Err = KernelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl TryFrom<String> for TypeCode {
    type Error = KernelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TypeCode> for String {
    fn from(value: TypeCode) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PreferenceScore {
    pub preference: Preference,
    pub score: f64,
    pub percent: u8,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DimensionResult {
    pub pair: TraitPair,
    pub left: PreferenceScore,
    pub right: PreferenceScore,
    pub dominant: PreferenceScore,
    pub total_questions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssessmentResult {
    pub type_code: TypeCode,
    pub scores: TraitScores,
    pub dimensions: Vec<DimensionResult>,
}

/// Accumulates weighted answers into per-letter scores.
///
/// Each resolvable answer adds `weight` to its question's choice-A letter and
/// `1 - weight` to its choice-B letter. Answers pointing past the end of the
/// catalog, or carrying a non-finite weight, are skipped. Finite weights
/// outside `[0, 1]` are clamped.
#[must_use]
pub fn compute_scores(answers: &[Answer], catalog: &QuestionCatalog) -> TraitScores {
    let mut scores = TraitScores::new();

    for answer in answers {
        let Some(question) = catalog.get(answer.question_id) else {
            continue;
        };
        let Some(weight) = effective_weight(answer.weight) else {
            continue;
        };

        scores.add(question.choice_a.value, weight);
        scores.add(question.choice_b.value, 1.0 - weight);
    }

    scores
}

#[must_use]
pub fn compute_type_code(scores: &TraitScores) -> TypeCode {
    TypeCode(TraitPair::ALL.map(|pair| scores.dominant(pair)))
}

#[must_use]
pub fn compute_dimensions(scores: &TraitScores, catalog: &QuestionCatalog) -> Vec<DimensionResult> {
    TraitPair::ALL
        .into_iter()
        .map(|pair| {
            let left_score = scores.get(pair.left());
            let right_score = scores.get(pair.right());
            let total_score = left_score + right_score;

            let left_percent = if total_score > 0.0 {
                percent_of(left_score, total_score)
            } else {
                50
            };
            let right_percent = 100 - left_percent;

            let left = PreferenceScore {
                preference: pair.left(),
                score: left_score,
                percent: left_percent,
            };
            let right = PreferenceScore {
                preference: pair.right(),
                score: right_score,
                percent: right_percent,
            };
            let dominant = if scores.dominant(pair) == pair.left() {
                left
            } else {
                right
            };

            DimensionResult {
                pair,
                left,
                right,
                dominant,
                total_questions: catalog.questions_in_pair(pair),
            }
        })
        .collect()
}

#[must_use]
pub fn compute_full_result(answers: &[Answer], catalog: &QuestionCatalog) -> AssessmentResult {
    let scores = compute_scores(answers, catalog);
    let type_code = compute_type_code(&scores);
    let dimensions = compute_dimensions(&scores, catalog);

    AssessmentResult {
        type_code,
        scores,
        dimensions,
    }
}

fn effective_weight(weight: f64) -> Option<f64> {
    if !weight.is_finite() {
        return None;
    }
    Some(weight.clamp(0.0, 1.0))
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn percent_of(part: f64, total: f64) -> u8 {
    ((part / total) * 100.0).round().clamp(0.0, 100.0) as u8
}

/// Storage keys and retention policy for session persistence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionConfig {
    pub progress_key: String,
    pub history_key: String,
    pub progress_ttl_days: u32,
    pub history_limit: usize,
}

impl SessionConfig {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            progress_key: "mbti_progress".to_string(),
            history_key: "mbti_history".to_string(),
            progress_ttl_days: 7,
            history_limit: 50,
        }
    }

    /// # Errors
    /// Returns [`KernelError::Configuration`] when keys are blank or equal,
    /// or when the retention bounds are zero.
    pub fn validate(&self) -> Result<(), KernelError> {
        for (name, key) in [
            ("progress_key", &self.progress_key),
            ("history_key", &self.history_key),
        ] {
            if key.trim().is_empty() {
                return Err(KernelError::Configuration(format!(
                    "{name} MUST be provided"
                )));
            }
        }

        if self.progress_key == self.history_key {
            return Err(KernelError::Configuration(
                "progress_key and history_key MUST differ".to_string(),
            ));
        }

        if self.progress_ttl_days == 0 {
            return Err(KernelError::Configuration(
                "progress_ttl_days MUST be >= 1".to_string(),
            ));
        }

        if self.history_limit == 0 {
            return Err(KernelError::Configuration(
                "history_limit MUST be >= 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Decodes and validates a session configuration from JSON.
    ///
    /// # Errors
    /// Returns [`KernelError::Configuration`] when decoding fails or the
    /// decoded values are invalid.
    pub fn from_json(value: &Value) -> Result<Self, KernelError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            KernelError::Configuration(format!("invalid session config JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn progress_ttl(&self) -> Duration {
        Duration::days(i64::from(self.progress_ttl_days))
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::v1()
    }
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[must_use]
pub fn unix_millis(value: OffsetDateTime) -> i64 {
    i64::try_from(value.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

/// # Errors
/// Returns [`KernelError::Validation`] when `millis` is outside the supported
/// date range.
pub fn from_unix_millis(millis: i64) -> Result<OffsetDateTime, KernelError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .map_err(|err| KernelError::Validation(format!("invalid unix millis {millis}: {err}")))
}

/// Formats `value` as `YYYY-MM-DD HH:MM` in UTC.
///
/// # Errors
/// Returns [`KernelError::Validation`] when formatting fails.
pub fn format_history_date(value: OffsetDateTime) -> Result<String, KernelError> {
    let format = time::format_description::parse("[year]-[month]-[day] [hour]:[minute]")
        .map_err(|err| KernelError::Validation(format!("invalid date format: {err}")))?;
    value
        .to_offset(UtcOffset::UTC)
        .format(&format)
        .map_err(|err| KernelError::Validation(format!("failed to format history date: {err}")))
}

/// True when strictly more than `ttl` has elapsed since `timestamp_millis`.
#[must_use]
pub fn is_expired(timestamp_millis: i64, now: OffsetDateTime, ttl: Duration) -> bool {
    i128::from(unix_millis(now)) - i128::from(timestamp_millis) > ttl.whole_milliseconds()
}
