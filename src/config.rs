use crate::automaton::Automaton;
use crate::engine::GraftPolicy;
use crate::error::{Result, RpqError};
use crate::windowing::DEFAULT_SLIDE_THRESHOLD;
use crate::{Label, Timestamp};
use regex::Regex;
use rustc_hash::FxHashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static CONFIG_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*=\s*(.*?)\s*$")
        .expect("config line pattern is valid")
});

/// Evaluation strategy selected by the `algorithm` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    TimestampPropagation,
    LandmarkTrees,
    RetentionForest,
}

impl Algorithm {
    pub fn from_code(code: u32) -> Result<Self> {
        match code {
            1 => Ok(Algorithm::TimestampPropagation),
            2 => Ok(Algorithm::LandmarkTrees),
            3 => Ok(Algorithm::RetentionForest),
            other => Err(RpqError::UnknownAlgorithm(other)),
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Algorithm::TimestampPropagation => 1,
            Algorithm::LandmarkTrees => 2,
            Algorithm::RetentionForest => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Algorithm::TimestampPropagation => "timestamp propagation",
            Algorithm::LandmarkTrees => "landmark trees",
            Algorithm::RetentionForest => "retention forest",
        }
    }
}

/// Parameters of one engine instance.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub algorithm: Algorithm,
    pub size: Timestamp,
    pub slide: Timestamp,
    pub query_type: u32,
    pub labels: Vec<Label>,
    /// Retention z-score threshold, `0.0` disables retention.
    pub zscore: f64,
    /// Out-of-order tolerance, `0` disables recovery.
    pub watermark: Timestamp,
    pub slide_threshold: i64,
    /// Use [`GraftPolicy::Reparent`] instead of first-claim grafting.
    pub strict: bool,
}

impl EngineConfig {
    pub fn new(size: Timestamp, slide: Timestamp, query_type: u32, labels: Vec<Label>) -> Self {
        Self {
            algorithm: Algorithm::RetentionForest,
            size,
            slide,
            query_type,
            labels,
            zscore: 0.0,
            watermark: 0,
            slide_threshold: DEFAULT_SLIDE_THRESHOLD,
            strict: false,
        }
    }

    pub fn with_zscore(mut self, zscore: f64) -> Self {
        self.zscore = zscore;
        self
    }

    pub fn with_watermark(mut self, watermark: Timestamp) -> Self {
        self.watermark = watermark;
        self
    }

    pub fn with_slide_threshold(mut self, slide_threshold: i64) -> Self {
        self.slide_threshold = slide_threshold;
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn graft_policy(&self) -> GraftPolicy {
        if self.strict {
            GraftPolicy::Reparent
        } else {
            GraftPolicy::FirstClaim
        }
    }

    /// Checks everything that must hold before a single edge is read.
    pub fn validate(&self) -> Result<()> {
        if self.size <= 0 || self.slide <= 0 {
            return Err(RpqError::InvalidWindow {
                size: self.size,
                slide: self.slide,
            });
        }
        if self.size % self.slide != 0 {
            return Err(RpqError::SizeNotMultipleOfSlide {
                size: self.size,
                slide: self.slide,
            });
        }
        if self.watermark < 0 {
            return Err(RpqError::Config(format!(
                "watermark must not be negative, got {}",
                self.watermark
            )));
        }
        if self.watermark > 0 && self.algorithm != Algorithm::RetentionForest {
            return Err(RpqError::OutOfOrderUnsupported(self.algorithm.name()));
        }
        if self.algorithm != Algorithm::RetentionForest {
            return Err(RpqError::EngineUnavailable(self.algorithm.name()));
        }
        Automaton::from_query_type(self.query_type, &self.labels)?;
        Ok(())
    }

    /// `"false"` without retention, the threshold with six decimals otherwise.
    pub fn retention_tag(&self) -> String {
        if self.zscore == 0.0 {
            "false".to_string()
        } else {
            format!("{:.6}", self.zscore)
        }
    }
}

/// Everything the `srpq` binary needs for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub input_data_path: PathBuf,
    pub output_base_folder: PathBuf,
    pub engine: EngineConfig,
}

impl RunConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&text)
    }

    /// Parses `key=value` lines. Blank lines and `#` comments are skipped;
    /// unknown keys are ignored.
    pub fn parse(text: &str) -> Result<Self> {
        let mut entries: FxHashMap<&str, &str> = FxHashMap::default();
        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let caps = CONFIG_LINE
                .captures(line)
                .ok_or_else(|| RpqError::Config(format!("cannot parse line {trimmed:?}")))?;
            if let (Some(key), Some(value)) = (caps.get(1), caps.get(2)) {
                entries.insert(key.as_str(), value.as_str());
            }
        }

        let required = |key: &str| {
            entries
                .get(key)
                .copied()
                .ok_or_else(|| RpqError::Config(format!("missing key {key}")))
        };

        let algorithm = Algorithm::from_code(parse_value(required("algorithm")?, "algorithm")?)?;
        let mut engine = EngineConfig::new(
            parse_value(required("size")?, "size")?,
            parse_value(required("slide")?, "slide")?,
            parse_value(required("query_type")?, "query_type")?,
            parse_labels(required("labels")?)?,
        )
        .with_algorithm(algorithm);

        if let Some(v) = entries.get("zscore") {
            engine.zscore = parse_value(v, "zscore")?;
        }
        if let Some(v) = entries.get("watermark") {
            engine.watermark = parse_value(v, "watermark")?;
        }
        if let Some(v) = entries.get("slide_threshold") {
            engine.slide_threshold = parse_value(v, "slide_threshold")?;
        }
        if let Some(v) = entries.get("strict") {
            engine.strict = parse_value(v, "strict")?;
        }

        Ok(Self {
            input_data_path: PathBuf::from(required("input_data_path")?),
            output_base_folder: PathBuf::from(
                entries.get("output_base_folder").copied().unwrap_or(""),
            ),
            engine,
        })
    }

    /// `output_<algorithm>_<query>_<size>_<slide>_<retention>`
    pub fn output_file_stem(&self) -> String {
        let e = &self.engine;
        format!(
            "output_{}_{}_{}_{}_{}",
            e.algorithm.code(),
            e.query_type,
            e.size,
            e.slide,
            e.retention_tag()
        )
    }

    pub fn summary_path(&self) -> PathBuf {
        self.output_base_folder
            .join(format!("{}.txt", self.output_file_stem()))
    }

    pub fn results_path(&self) -> PathBuf {
        self.output_base_folder
            .join(format!("{}.csv", self.output_file_stem()))
    }
}

fn parse_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| RpqError::Config(format!("invalid value {value:?} for {key}")))
}

fn parse_labels(value: &str) -> Result<Vec<Label>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| parse_value(s, "labels"))
        .collect()
}
