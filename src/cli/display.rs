use std::io::Write;

use console::{Style, style};

use crate::agent::{RoleRegistry, RoleTable};
use crate::delivery::StateNotice;
use crate::phase::Phase;
use crate::session::{FeasibilityStatus, SessionSnapshot};

pub struct Display;

impl Display {
    pub fn new() -> Self {
        Self
    }

    pub fn print_header(&self, text: &str) {
        println!();
        println!("{}", style(text).bold().cyan());
        println!("{}", style("═".repeat(60)).dim());
        println!();
    }

    pub fn print_session(&self, snapshot: &SessionSnapshot) {
        let phase_style = self.phase_style(snapshot.phase);

        println!(
            "{}  {}",
            style(snapshot.session_id.as_str()).bold(),
            style(format!("v{}", snapshot.version)).dim()
        );
        println!(
            "    Phase:    {}",
            phase_style.apply_to(snapshot.phase.to_string())
        );

        if !snapshot.question.text.is_empty() {
            let status = if snapshot.question.is_locked() {
                style("[locked]").yellow()
            } else {
                style("[draft]").dim()
            };
            println!("    Question: {} {}", snapshot.question.text, status);
        }

        if !snapshot.keywords.is_empty() {
            let keywords: Vec<&str> = snapshot.keywords.iter().map(String::as_str).collect();
            println!("    Keywords: {}", keywords.join(", "));
        }

        for element in &snapshot.scope_elements {
            println!(
                "    Scope:    {}: {}",
                style(&element.name).bold(),
                element.description
            );
        }

        if let Some(feasibility) = &snapshot.feasibility {
            println!(
                "    Feasibility: {} ({}/10)",
                self.feasibility_style(feasibility.status)
                    .apply_to(feasibility.status.to_string()),
                feasibility.score
            );
            println!(
                "    {}",
                style(feasibility.status.resource_suggestion()).dim()
            );
        }

        if !snapshot.reflection_log.is_empty() {
            println!(
                "    {}",
                style(format!(
                    "Reflections: {} recorded",
                    snapshot.reflection_log.len()
                ))
                .dim()
            );
        }

        println!();
    }

    /// One line per push notice. Routine snapshots print dim so the
    /// scripted narrative stays readable.
    pub fn print_notice(&self, notice: &StateNotice) {
        match notice {
            StateNotice::Snapshot {
                version, snapshot, ..
            } => {
                println!(
                    "  {}",
                    style(format!("push: snapshot v{} ({})", version, snapshot.phase)).dim()
                );
            }
            StateNotice::TaskFailed {
                task_type, error, ..
            } => {
                self.print_warning(&format!("push: task {} failed: {}", task_type, error));
            }
            StateNotice::TaskStale {
                task_type, reason, ..
            } => {
                self.print_warning(&format!("push: task {} went stale: {}", task_type, reason));
            }
            StateNotice::Resync { version, .. } => {
                self.print_warning(&format!(
                    "push: state delivery overflowed, resync at v{}",
                    version
                ));
            }
        }
    }

    pub fn print_chunk(&self, text: &str) {
        print!("{}", style(text).italic());
        let _ = std::io::stdout().flush();
    }

    pub fn finish_chunks(&self, chunks: u64) {
        println!("  {}", style(format!("[{} chunks]", chunks)).dim());
    }

    pub fn print_roles(&self, table: &RoleTable) {
        println!(
            "{:<24} {:<8} {:<9} {}",
            style("Task type").bold(),
            style("Lane").bold(),
            style("Attempts").bold(),
            style("Prompt").bold()
        );
        println!("{}", style("─".repeat(65)).dim());

        for task_type in table.task_types() {
            let Some(role) = table.role(&task_type) else {
                continue;
            };
            println!(
                "{:<24} {:<8} {:<9} {}",
                task_type,
                role.lane,
                role.retry.max_attempts,
                style(&role.prompt_ref).dim()
            );
        }
    }

    pub fn print_success(&self, message: &str) {
        println!("{} {}", style("✓").green().bold(), message);
    }

    pub fn print_error(&self, message: &str) {
        eprintln!("{} {}", style("✗").red().bold(), message);
    }

    pub fn print_warning(&self, message: &str) {
        println!("{} {}", style("!").yellow().bold(), message);
    }

    pub fn print_info(&self, message: &str) {
        println!("{} {}", style("→").cyan(), message);
    }

    fn phase_style(&self, phase: Phase) -> Style {
        match phase {
            Phase::Initiation => Style::new().dim(),
            Phase::Exploration => Style::new().blue(),
            Phase::Formulation => Style::new().yellow(),
            Phase::Collection => Style::new().cyan(),
            Phase::Presentation => Style::new().magenta(),
            Phase::Closed => Style::new().green(),
        }
    }

    fn feasibility_style(&self, status: FeasibilityStatus) -> Style {
        match status {
            FeasibilityStatus::Low => Style::new().red(),
            FeasibilityStatus::Medium => Style::new().yellow(),
            FeasibilityStatus::High => Style::new().green(),
        }
    }
}

impl Default for Display {
    fn default() -> Self {
        Self::new()
    }
}
