//! Progress indicators with CI fallback

use super::context::UiContext;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};

/// A task spinner with CI fallback
pub struct TaskSpinner {
    spinner: Option<cliclack::ProgressBar>,
    interactive: bool,
}

impl TaskSpinner {
    pub fn new(ctx: &UiContext) -> Self {
        Self {
            spinner: None,
            interactive: ctx.use_fancy_output(),
        }
    }

    pub fn start(&mut self, message: &str) {
        if self.interactive {
            let spinner = cliclack::spinner();
            spinner.start(message);
            self.spinner = Some(spinner);
        } else {
            println!("{} {}", style("...").dim(), message);
        }
    }

    pub fn stop(&mut self, message: &str) {
        if let Some(spinner) = self.spinner.take() {
            spinner.stop(message);
        } else {
            println!("{} {}", style("[OK]").green(), message);
        }
    }

    pub fn stop_error(&mut self, message: &str) {
        if let Some(spinner) = self.spinner.take() {
            spinner.error(message);
        } else {
            println!("{} {}", style("[FAIL]").red(), message);
        }
    }
}

/// Progress bar for browse index rebuilds.
///
/// Fed the `N% Complete` lines the index reports after each page.
pub struct RebuildProgress {
    bar: Option<ProgressBar>,
}

impl RebuildProgress {
    pub fn new(ctx: &UiContext, repository: &str) -> Self {
        let bar = if ctx.use_fancy_output() {
            let bar = ProgressBar::new(100);
            let template = ProgressStyle::default_bar()
                .template("  {spinner:.cyan} Rebuilding {prefix}  {bar:20.cyan/dim} {pos}%  {elapsed:.dim}")
                .unwrap_or_else(|_| ProgressStyle::default_bar());
            bar.set_style(template.progress_chars("━╸─"));
            bar.set_prefix(repository.to_string());
            bar.enable_steady_tick(std::time::Duration::from_millis(120));
            Some(bar)
        } else {
            println!("Rebuilding {}...", repository);
            None
        };
        Self { bar }
    }

    /// Handle one progress report from the index
    pub fn on_progress(&self, line: &str) {
        match (&self.bar, parse_percent(line)) {
            (Some(bar), Some(percent)) => bar.set_position(percent),
            (Some(_), None) => {}
            (None, _) => println!("  {}", line),
        }
    }

    pub fn finish(&self) {
        if let Some(ref bar) = self.bar {
            bar.disable_steady_tick();
            bar.finish_and_clear();
        }
    }
}

/// `"42% Complete"` -> 42
fn parse_percent(line: &str) -> Option<u64> {
    let percent: u64 = line.strip_suffix("% Complete")?.trim().parse().ok()?;
    Some(percent.min(100))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spinner_non_interactive() {
        let ctx = UiContext::non_interactive();
        let mut spinner = TaskSpinner::new(&ctx);
        spinner.start("Fetching...");
        spinner.stop("Done");
    }

    #[test]
    fn parse_percent_lines() {
        assert_eq!(parse_percent("42% Complete"), Some(42));
        assert_eq!(parse_percent("100% Complete"), Some(100));
        assert_eq!(parse_percent("140% Complete"), Some(100));
        assert_eq!(parse_percent("Complete"), None);
        assert_eq!(parse_percent("abc% Complete"), None);
    }

    #[test]
    fn rebuild_progress_non_interactive() {
        let ctx = UiContext::non_interactive();
        let progress = RebuildProgress::new(&ctx, "npmjs");
        progress.on_progress("50% Complete");
        progress.on_progress("100% Complete");
        progress.finish();
    }
}
