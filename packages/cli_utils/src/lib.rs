#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Terminal plumbing for the damage assessment binary.
//!
//! [`init_logger`] installs `pretty_env_logger` behind `indicatif-log-bridge`
//! so log lines do not tear through progress bars. Two bars hang off the
//! returned [`MultiProgress`]: [`IndicatifProgress`] counts extraction pages
//! and [`StageProgress`] follows the pipeline stages by listening to
//! [`PipelineEvent`]s.

use std::sync::Arc;
use std::time::Duration;

use damage_assessment_feature_service::progress::ProgressCallback;
use damage_assessment_report_models::{PipelineEvent, Reporter};
use indicatif::{ProgressBar, ProgressStyle};

pub use indicatif::MultiProgress;

/// Page counter for the extractor.
pub struct IndicatifProgress {
    bar: ProgressBar,
    /// Applied once the page count is known.
    bar_style: ProgressStyle,
}

impl IndicatifProgress {
    /// Spins while ids are being listed, then becomes a page bar when the
    /// extractor calls [`ProgressCallback::set_total()`].
    #[must_use]
    pub fn pages_bar(multi: &MultiProgress, message: &str) -> Arc<dyn ProgressCallback> {
        let bar = multi.add(ProgressBar::new_spinner());
        bar.enable_steady_tick(Duration::from_millis(100));
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_message(message.to_string());

        let bar_style = ProgressStyle::with_template(
            "  {msg} {wide_bar:.cyan/dim} {pos}/{len} pages {percent}% [{eta}]",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-");

        Arc::new(Self { bar, bar_style })
    }
}

impl ProgressCallback for IndicatifProgress {
    fn set_total(&self, total: u64) {
        self.bar.set_length(total);
        self.bar.set_position(0);
        self.bar.set_style(self.bar_style.clone());
    }

    fn inc(&self, delta: u64) {
        self.bar.inc(delta);
    }

    fn set_message(&self, msg: String) {
        self.bar.set_message(msg);
    }

    fn finish(&self, msg: String) {
        self.bar.finish_with_message(msg);
    }
}

/// Stage spinner driven by pipeline events. Ignores every other event.
pub struct StageProgress {
    bar: ProgressBar,
}

impl StageProgress {
    #[must_use]
    pub fn new(multi: &MultiProgress) -> Self {
        let bar = multi.add(ProgressBar::new_spinner());
        bar.enable_steady_tick(Duration::from_millis(100));
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} {msg} ({pos} stages done) [{elapsed_precise}]",
            )
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        Self { bar }
    }

    /// Stages finished so far.
    #[must_use]
    pub fn finished_stages(&self) -> u64 {
        self.bar.position()
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl Reporter for StageProgress {
    fn report(&self, event: PipelineEvent) {
        match event {
            PipelineEvent::StageStarted { stage } => self.bar.set_message(stage.to_string()),
            PipelineEvent::StageFinished { .. } => self.bar.inc(1),
            _ => {}
        }
    }
}

/// Installs the global logger behind `indicatif-log-bridge` and returns the
/// [`MultiProgress`] every bar must be added to.
#[must_use]
pub fn init_logger() -> MultiProgress {
    let multi = MultiProgress::new();

    let logger = pretty_env_logger::formatted_builder()
        .parse_env("RUST_LOG")
        .build();
    let level = logger.filter();

    // Already set when called twice (tests).
    indicatif_log_bridge::LogWrapper::new(multi.clone(), logger)
        .try_init()
        .ok();

    log::set_max_level(level);

    multi
}
