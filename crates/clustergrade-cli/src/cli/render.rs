//! Terminal rendering of step progress.
//!
//! Subscribes to the hub's event bus and draws one line per substep: a
//! spinner while it runs, then its final status. Substep output is echoed
//! in verbose mode, and statement batches get a progress bar.

use std::time::Duration;

use clustergrade_core::event::bus::EventBus;
use clustergrade_types::event::UpgradeEvent;
use clustergrade_types::step::{Substep, SubstepStatus};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

/// `[COMPLETE]`-style label for a final status.
pub fn status_label(status: SubstepStatus) -> String {
    let label = format!("[{}]", status.as_str().to_ascii_uppercase());
    match status {
        SubstepStatus::Complete => style(label).green().to_string(),
        SubstepStatus::Failed => style(label).red().bold().to_string(),
        SubstepStatus::Skipped => style(label).dim().to_string(),
        SubstepStatus::Running | SubstepStatus::Pending => style(label).yellow().to_string(),
    }
}

struct Progress {
    verbose: bool,
    spinner: Option<(Substep, ProgressBar)>,
    statements: Option<ProgressBar>,
}

impl Progress {
    fn new(verbose: bool) -> Self {
        Self {
            verbose,
            spinner: None,
            statements: None,
        }
    }

    fn println(&self, line: &str) {
        match &self.spinner {
            Some((_, bar)) => bar.println(line),
            None => println!("{line}"),
        }
    }

    fn handle(&mut self, event: UpgradeEvent) {
        match event {
            UpgradeEvent::StepStarted { .. } => {}
            UpgradeEvent::SubstepStatus {
                substep,
                status: SubstepStatus::Running,
                ..
            } => self.start(substep),
            UpgradeEvent::SubstepStatus {
                substep, status, ..
            } => self.finish(substep, status),
            UpgradeEvent::SubstepOutput { line, .. } => {
                if self.verbose {
                    self.println(&line);
                }
            }
            UpgradeEvent::StatementProgress { completed, total } => {
                let bar = self.statements.get_or_insert_with(|| {
                    let bar = ProgressBar::new(total as u64);
                    if let Ok(bar_style) =
                        ProgressStyle::default_bar().template("  {bar:40.cyan/blue} {pos}/{len} statements")
                    {
                        bar.set_style(bar_style);
                    }
                    bar
                });
                bar.set_length(total as u64);
                bar.set_position(completed as u64);
                if completed >= total {
                    bar.finish_and_clear();
                    self.statements = None;
                }
            }
            UpgradeEvent::StepFinished { .. } => self.clear(),
        }
    }

    fn start(&mut self, substep: Substep) {
        self.clear();
        let spinner = ProgressBar::new_spinner();
        if let Ok(spinner_style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            spinner.set_style(spinner_style);
        }
        spinner.set_message(format!("{}...", substep.description()));
        spinner.enable_steady_tick(Duration::from_millis(80));
        self.spinner = Some((substep, spinner));
    }

    fn finish(&mut self, substep: Substep, status: SubstepStatus) {
        if let Some((running, bar)) = self.spinner.take() {
            if running != substep {
                self.spinner = Some((running, bar));
            } else {
                bar.finish_and_clear();
            }
        }
        self.println(&format!(
            "{:<60} {}",
            format!("{}...", substep.description()),
            status_label(status)
        ));
    }

    fn clear(&mut self) {
        if let Some((_, bar)) = self.spinner.take() {
            bar.finish_and_clear();
        }
    }
}

/// Background task drawing the events of one command.
pub struct Renderer {
    handle: JoinHandle<()>,
    done: oneshot::Sender<()>,
}

impl Renderer {
    pub fn spawn(bus: &EventBus, verbose: bool) -> Self {
        let mut rx = bus.subscribe();
        let (done, mut stop) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let mut progress = Progress::new(verbose);
            loop {
                tokio::select! {
                    biased;
                    event = rx.recv() => match event {
                        Ok(event) => progress.handle(event),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::debug!(missed, "renderer fell behind");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = &mut stop => {
                        while let Ok(event) = rx.try_recv() {
                            progress.handle(event);
                        }
                        break;
                    }
                }
            }
            progress.clear();
        });
        Self { handle, done }
    }

    /// Draw whatever is still queued and stop.
    pub async fn finish(self) {
        let _ = self.done.send(());
        let _ = self.handle.await;
    }
}
