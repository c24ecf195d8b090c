//! Output formatting module

pub mod json;
pub mod progress;
pub mod styles;

use console::Term;
use owo_colors::OwoColorize as _;
pub use styles::Styles;

/// Output context carrying styling and terminal state.
pub struct OutputContext {
    /// Stylesheet for colored output.
    pub styles: Styles,
    /// Whether stdout is a TTY.
    pub is_tty: bool,
    /// Whether to suppress non-error output.
    pub quiet: bool,
    /// Whether to print debug-level detail.
    pub verbose: bool,
}

impl OutputContext {
    /// Create output context based on CLI flags and environment.
    #[must_use]
    pub fn new(no_color: bool, quiet: bool) -> Self {
        let is_tty = Term::stdout().is_term();
        let use_colors = !no_color && is_tty && std::env::var("NO_COLOR").is_err();

        let mut styles = Styles::default();
        if use_colors {
            styles.colorize();
        }

        Self {
            styles,
            is_tty,
            quiet,
            verbose: false,
        }
    }

    /// Enable debug-level detail.
    #[must_use]
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Check if progress indicators should be shown.
    #[must_use]
    pub fn show_progress(&self) -> bool {
        self.is_tty && !self.quiet
    }

    /// Print a success message prefixed with `✓`. Suppressed when `quiet`.
    pub fn success(&self, msg: &str) {
        if !self.quiet {
            println!("  {} {msg}", "✓".style(self.styles.success));
        }
    }

    /// Print a warning message prefixed with `⚠`. Suppressed when `quiet`.
    pub fn warn(&self, msg: &str) {
        if !self.quiet {
            println!("  {} {msg}", "⚠".style(self.styles.warning));
        }
    }

    /// Print an error message prefixed with `✗` to stderr. Never suppressed.
    pub fn error(&self, msg: &str) {
        eprintln!("  {} {msg}", "✗".style(self.styles.error));
    }

    /// Print an info message prefixed with `ℹ`. Suppressed when `quiet`.
    pub fn info(&self, msg: &str) {
        if !self.quiet {
            println!("  {} {msg}", "ℹ".style(self.styles.info));
        }
    }

    /// Print a section header. Suppressed when `quiet`.
    pub fn header(&self, msg: &str) {
        if !self.quiet {
            println!("  {}", msg.style(self.styles.header));
        }
    }

    /// Print a key-value pair with the key dimmed. Suppressed when `quiet`.
    pub fn kv(&self, key: &str, value: &str) {
        if !self.quiet {
            println!("  {}  {value}", key.style(self.styles.dim));
        }
    }

    /// Print a dimmed debug line. Only shown with `--verbose`.
    pub fn debug(&self, msg: &str) {
        if self.verbose && !self.quiet {
            println!("  {}", msg.style(self.styles.dim));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use owo_colors::OwoColorize;
    use proptest::prelude::*;

    #[test]
    fn test_styles_default_has_no_colors() {
        let styles = Styles::default();
        let styled = format!("{}", "test".style(styles.success));
        assert_eq!(styled, "test");
    }

    #[test]
    fn test_styles_colorize_applies_colors() {
        let mut styles = Styles::default();
        styles.colorize();
        let styled = format!("{}", "test".style(styles.success));
        assert!(styled.contains("\x1b["), "should contain ANSI escape code");
    }

    #[test]
    fn test_no_color_flag_disables_colors() {
        let ctx = OutputContext::new(true, false);
        let styled = format!("{}", "test".style(ctx.styles.success));
        assert!(!styled.contains("\x1b["));
    }

    #[test]
    fn test_show_progress_false_when_quiet() {
        let ctx = OutputContext::new(false, true);
        assert!(!ctx.show_progress());
    }

    #[test]
    fn test_error_does_not_panic_when_quiet() {
        // error() is never suppressed
        let ctx = OutputContext::new(true, true);
        ctx.error("connection refused");
    }

    proptest! {
        #[test]
        fn prop_no_color_never_produces_ansi(text in "[a-zA-Z0-9 ]{1,50}") {
            let ctx = OutputContext::new(true, false);
            let styled = format!("{}", text.style(ctx.styles.success));
            prop_assert!(!styled.contains("\x1b["));
        }

        #[test]
        fn prop_helper_methods_do_not_panic(msg in "[a-zA-Z0-9 .,!?_-]{0,100}") {
            let ctx = OutputContext::new(true, false);
            ctx.success(&msg);
            ctx.warn(&msg);
            ctx.error(&msg);
            ctx.info(&msg);
            ctx.header(&msg);
            ctx.kv("key", &msg);
        }
    }
}
