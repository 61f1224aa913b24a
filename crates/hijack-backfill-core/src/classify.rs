//! Classification seams.
//!
//! Tagging methodology and the inference model live outside this crate. The
//! pipeline only drives them through [`Tagger`] and [`InferenceEngine`],
//! built per worker by a [`ClassifierFactory`]. [`BaselineClassifier`] is the
//! shipped implementation: it refreshes the summary from the records and
//! records an `unclassified` placeholder inference.

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::event::{Event, Inference, InferenceResult};

/// Inference id written by [`BaselineClassifier`].
pub const UNCLASSIFIED_INFERENCE: &str = "unclassified";

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Tagger configuration. Build through [`TaggerOptions::builder`] so the
/// cross-field rules are checked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggerOptions {
    pub in_memory_data: bool,
    pub enable_finisher: bool,
    pub force_process_view: bool,
    pub load_unfinished: bool,
    pub produce_kafka_message: bool,
    pub debug: bool,
}

impl TaggerOptions {
    #[must_use]
    pub fn builder() -> TaggerOptionsBuilder {
        TaggerOptionsBuilder::default()
    }

    /// Re-check the cross-field rules.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.load_unfinished && !self.enable_finisher {
            return Err(ConfigError::Invalid(
                "load_unfinished requires enable_finisher".to_string(),
            ));
        }
        if self.produce_kafka_message && self.debug {
            return Err(ConfigError::Invalid(
                "produce_kafka_message cannot be combined with debug".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaggerOptionsBuilder {
    options: TaggerOptions,
}

impl TaggerOptionsBuilder {
    #[must_use]
    pub fn in_memory_data(mut self, on: bool) -> Self {
        self.options.in_memory_data = on;
        self
    }

    #[must_use]
    pub fn enable_finisher(mut self, on: bool) -> Self {
        self.options.enable_finisher = on;
        self
    }

    #[must_use]
    pub fn force_process_view(mut self, on: bool) -> Self {
        self.options.force_process_view = on;
        self
    }

    #[must_use]
    pub fn load_unfinished(mut self, on: bool) -> Self {
        self.options.load_unfinished = on;
        self
    }

    #[must_use]
    pub fn produce_kafka_message(mut self, on: bool) -> Self {
        self.options.produce_kafka_message = on;
        self
    }

    #[must_use]
    pub fn debug(mut self, on: bool) -> Self {
        self.options.debug = on;
        self
    }

    pub fn build(self) -> std::result::Result<TaggerOptions, ConfigError> {
        self.options.validate()?;
        Ok(self.options)
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Applies tags to one event at a time.
pub trait Tagger: Send {
    /// Refresh external datasets for a view. Called before every event.
    fn update_datasets(&mut self, _view_ts: u64) -> Result<()> {
        Ok(())
    }

    /// Load per-view state. Called before every event.
    fn prepare_for_view(&mut self, _view_ts: u64) -> Result<()> {
        Ok(())
    }

    fn tag_event(&mut self, event: &mut Event) -> Result<()>;
}

/// Produces the inference result of one event.
pub trait InferenceEngine: Send {
    fn infer(&mut self, event: &mut Event) -> Result<()>;
}

/// Builds one tagger and one inference engine per worker.
pub trait ClassifierFactory: Send + Sync {
    fn tagger(&self, options: &TaggerOptions) -> Result<Box<dyn Tagger>>;

    fn inference_engine(&self) -> Result<Box<dyn InferenceEngine>>;
}

// ---------------------------------------------------------------------------
// Baseline
// ---------------------------------------------------------------------------

/// Summary-only classifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct BaselineClassifier;

impl Tagger for BaselineClassifier {
    fn tag_event(&mut self, event: &mut Event) -> Result<()> {
        let mut prefixes = std::collections::BTreeSet::new();
        let mut ases = std::collections::BTreeSet::new();
        for record in event.records() {
            prefixes.extend(record.details.prefixes().into_iter().map(str::to_string));
            ases.extend(record.details.ases());
        }
        event.summary.prefixes = prefixes;
        event.summary.ases = ases;
        Ok(())
    }
}

impl InferenceEngine for BaselineClassifier {
    fn infer(&mut self, event: &mut Event) -> Result<()> {
        let verdict = Inference {
            inference_id: UNCLASSIFIED_INFERENCE.to_string(),
            suspicion_level: 0,
            confidence: 0,
        };
        event.summary.inference_result = Some(InferenceResult {
            primary_inference: Some(verdict.clone()),
            inferences: vec![verdict],
        });
        Ok(())
    }
}

impl ClassifierFactory for BaselineClassifier {
    fn tagger(&self, options: &TaggerOptions) -> Result<Box<dyn Tagger>> {
        options.validate()?;
        Ok(Box::new(Self))
    }

    fn inference_engine(&self) -> Result<Box<dyn InferenceEngine>> {
        Ok(Box::new(Self))
    }
}
