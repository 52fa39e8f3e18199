pub mod config;
pub mod experiment;
pub mod metrics;
pub mod report;
pub mod rng;
pub mod visualization;

pub use config::load_or_init;
pub use experiment::{ExperimentArgs, ExperimentMode};
pub use metrics::{EpochMetrics, LossCurves};
pub use report::{ensure_report_file, update_sections, ReportSection, DEFAULT_REPORT_TEMPLATE};
pub use rng::{seeded_rng, shuffled_indices};
pub use visualization::{
    color_hex, encode_rgb_png_data_url, render_loss_chart, render_terminal_chart, save_png,
    series_color,
};
