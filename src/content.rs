//! Generated content, one typed record per job kind.
//!
//! Each kind has a [`Schema`] describing the fields the model is asked to produce. Raw model
//! output goes through the extraction ladder and the schema before it is turned into a
//! [`JobContent`], so every variant is always fully populated.

use crate::error::ExtractionFailure;
use crate::extract::{extract_validated, ExtractionStep, FieldKind, Schema};
use crate::jobs::JobKind;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleSection {
    pub heading: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleContent {
    pub title: String,
    pub summary: String,
    pub sections: Vec<ArticleSection>,
    pub tags: Vec<String>,
    pub image_prompt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizQuestion {
    pub question: String,
    pub options: Vec<String>,
    pub answer: String,
    pub explanation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizContent {
    pub title: String,
    pub questions: Vec<QuizQuestion>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flashcard {
    pub front: String,
    pub back: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlashcardsContent {
    pub title: String,
    pub cards: Vec<Flashcard>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipeContent {
    pub title: String,
    pub servings: i64,
    pub ingredients: Vec<String>,
    pub steps: Vec<String>,
    pub image_prompt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryContent {
    pub title: String,
    pub paragraphs: Vec<String>,
    pub moral: String,
    pub image_prompt: String,
}

/// Content payload of a job, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobContent {
    Article(ArticleContent),
    Quiz(QuizContent),
    Flashcards(FlashcardsContent),
    Recipe(RecipeContent),
    Story(StoryContent),
}

fn untitled() -> Value {
    json!("Untitled")
}

/// Required fields and defaults for `kind`.
pub fn schema_for(kind: JobKind) -> Schema {
    let strings = || FieldKind::sequence_of(FieldKind::String);
    match kind {
        JobKind::Article => Schema::new()
            .field_with_default("title", FieldKind::String, untitled())
            .field("summary", FieldKind::String)
            .field(
                "sections",
                FieldKind::sequence_of(FieldKind::Object(
                    Schema::new()
                        .field("heading", FieldKind::String)
                        .field("body", FieldKind::String),
                )),
            )
            .field("tags", strings())
            .field("image_prompt", FieldKind::String),
        JobKind::Quiz => Schema::new()
            .field_with_default("title", FieldKind::String, untitled())
            .field(
                "questions",
                FieldKind::sequence_of(FieldKind::Object(
                    Schema::new()
                        .field("question", FieldKind::String)
                        .field("options", strings())
                        .field("answer", FieldKind::String)
                        .field("explanation", FieldKind::String),
                )),
            ),
        JobKind::Flashcards => Schema::new()
            .field_with_default("title", FieldKind::String, untitled())
            .field(
                "cards",
                FieldKind::sequence_of(FieldKind::Object(
                    Schema::new()
                        .field("front", FieldKind::String)
                        .field("back", FieldKind::String),
                )),
            ),
        JobKind::Recipe => Schema::new()
            .field_with_default("title", FieldKind::String, untitled())
            .field_with_default("servings", FieldKind::Integer, json!(1))
            .field("ingredients", strings())
            .field("steps", strings())
            .field("image_prompt", FieldKind::String),
        JobKind::Story => Schema::new()
            .field_with_default("title", FieldKind::String, untitled())
            .field("paragraphs", strings())
            .field("moral", FieldKind::String)
            .field("image_prompt", FieldKind::String),
    }
}

fn typed<T: DeserializeOwned>(record: Map<String, Value>) -> Result<T, ExtractionFailure> {
    serde_json::from_value(Value::Object(record))
        .map_err(|e| ExtractionFailure::MalformedJson(e.to_string()))
}

impl JobContent {
    /// Extract and validate model output for `kind`.
    pub fn from_output(
        kind: JobKind,
        text: &str,
        truncated: bool,
    ) -> Result<(JobContent, ExtractionStep), ExtractionFailure> {
        let extracted = extract_validated(text, truncated, &schema_for(kind))?;
        let content = Self::from_record(kind, extracted.record)?;
        Ok((content, extracted.step))
    }

    /// Build content from an already-normalized record.
    pub fn from_record(
        kind: JobKind,
        record: Map<String, Value>,
    ) -> Result<JobContent, ExtractionFailure> {
        Ok(match kind {
            JobKind::Article => JobContent::Article(typed(record)?),
            JobKind::Quiz => JobContent::Quiz(typed(record)?),
            JobKind::Flashcards => JobContent::Flashcards(typed(record)?),
            JobKind::Recipe => JobContent::Recipe(typed(record)?),
            JobKind::Story => JobContent::Story(typed(record)?),
        })
    }

    pub fn kind(&self) -> JobKind {
        match self {
            JobContent::Article(_) => JobKind::Article,
            JobContent::Quiz(_) => JobKind::Quiz,
            JobContent::Flashcards(_) => JobKind::Flashcards,
            JobContent::Recipe(_) => JobKind::Recipe,
            JobContent::Story(_) => JobKind::Story,
        }
    }

    pub fn title(&self) -> &str {
        match self {
            JobContent::Article(c) => &c.title,
            JobContent::Quiz(c) => &c.title,
            JobContent::Flashcards(c) => &c.title,
            JobContent::Recipe(c) => &c.title,
            JobContent::Story(c) => &c.title,
        }
    }

    /// Illustration prompt the model suggested, if any.
    pub fn image_prompt(&self) -> Option<&str> {
        let prompt = match self {
            JobContent::Article(c) => c.image_prompt.as_str(),
            JobContent::Recipe(c) => c.image_prompt.as_str(),
            JobContent::Story(c) => c.image_prompt.as_str(),
            JobContent::Quiz(_) | JobContent::Flashcards(_) => "",
        };
        (!prompt.trim().is_empty()).then_some(prompt)
    }
}
