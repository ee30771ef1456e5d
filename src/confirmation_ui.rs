//! Terminal dialog for confirming staged changes.
//!
//! Shows the generated plan and asks the user whether to apply or discard it.
//! Nothing reaches the remote account unless the user picks apply.

use crate::assistant::{ApplyResponse, ChatResponse};
use anyhow::Result;
use std::io::{self, BufRead, Write};
use tracing::info;

/// The user's answer to a confirmation dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Apply,
    Discard,
}

/// The parts of a staged change shown to the user.
#[derive(Debug)]
pub struct Proposal<'a> {
    pub action_id: &'a str,
    pub plan: &'a str,
    pub resource_list: &'a [String],
    pub cost_estimate: &'a str,
    pub warnings: &'a [String],
    pub rendered_artifact: &'a str,
}

impl<'a> Proposal<'a> {
    /// Borrows a proposal out of a confirmation-required chat response.
    pub fn from_chat(response: &'a ChatResponse) -> Option<Self> {
        match response {
            ChatResponse::ConfirmationRequired {
                action_id,
                plan,
                resource_list,
                cost_estimate,
                warnings,
                rendered_artifact,
                ..
            } => Some(Self {
                action_id,
                plan,
                resource_list,
                cost_estimate,
                warnings,
                rendered_artifact,
            }),
            _ => None,
        }
    }
}

/// Handles user interaction for change confirmation.
///
/// In verbose mode the full rendered artifact is printed along with the plan.
pub struct ConfirmationUI {
    verbose: bool,
}

impl ConfirmationUI {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    // =========================================================================
    // Core methods with I/O injection (testable)
    // =========================================================================

    /// Shows `proposal` and reads the user's decision.
    ///
    /// Loops until `1` (apply) or `2` (discard) is entered. End of input
    /// counts as discard.
    pub fn prompt_with_io<R: BufRead, W: Write>(
        &self,
        proposal: &Proposal<'_>,
        input: &mut R,
        output: &mut W,
    ) -> Result<Decision> {
        self.display_proposal_with_io(proposal, output)?;

        loop {
            write!(output, "\nChoose an option (1/2): ")?;
            output.flush()?;

            let mut line = String::new();
            if input.read_line(&mut line)? == 0 {
                writeln!(output)?;
                info!("Input closed, discarding action {}", proposal.action_id);
                return Ok(Decision::Discard);
            }

            match line.trim() {
                "1" => {
                    info!("User chose to apply action {}", proposal.action_id);
                    return Ok(Decision::Apply);
                }
                "2" => {
                    info!("User chose to discard action {}", proposal.action_id);
                    return Ok(Decision::Discard);
                }
                _ => {
                    writeln!(output, "Invalid choice. Please enter 1 or 2.")?;
                }
            }
        }
    }

    fn display_proposal_with_io<W: Write>(&self, proposal: &Proposal<'_>, output: &mut W) -> Result<()> {
        writeln!(output, "\n{}", "=".repeat(60))?;
        writeln!(output, "🛠️  PROPOSED CHANGE")?;
        writeln!(output, "{}", "=".repeat(60))?;
        writeln!(output)?;
        writeln!(output, "{}", proposal.plan)?;
        writeln!(output)?;

        writeln!(output, "📦 Resources:")?;
        for resource in proposal.resource_list {
            writeln!(output, "   • {}", resource)?;
        }
        writeln!(output)?;
        writeln!(output, "💰 Estimated cost: {}", proposal.cost_estimate)?;

        if !proposal.warnings.is_empty() {
            writeln!(output)?;
            writeln!(output, "⚠️  Warnings:")?;
            for warning in proposal.warnings {
                writeln!(output, "   - {}", warning)?;
            }
        }

        if self.verbose {
            writeln!(output)?;
            writeln!(output, "📄 Rendered configuration:")?;
            writeln!(output, "{}", "-".repeat(60))?;
            writeln!(output, "{}", proposal.rendered_artifact.trim_end())?;
        }

        writeln!(output, "{}", "-".repeat(60))?;
        writeln!(output, "What would you like to do?")?;
        writeln!(output)?;
        writeln!(output, "  1️⃣  Apply   - Create these resources in your account")?;
        writeln!(output, "  2️⃣  Discard - Drop this plan, nothing is created")?;
        writeln!(output)?;
        writeln!(output, "{}", "=".repeat(60))?;

        Ok(())
    }

    pub fn show_discarded_with_io<W: Write>(&self, output: &mut W) -> Result<()> {
        writeln!(output, "\n🗑️  Plan discarded. Nothing was created.")?;
        Ok(())
    }

    /// Shows the outcome of an apply, including outputs on success.
    pub fn show_apply_result_with_io<W: Write>(&self, response: &ApplyResponse, output: &mut W) -> Result<()> {
        if !response.success {
            writeln!(output, "\n❌ Apply failed:")?;
            writeln!(output, "{}", response.message)?;
            return Ok(());
        }

        writeln!(output, "\n{}", response.message)?;
        if !response.outputs.is_empty() {
            writeln!(output, "📤 Outputs:")?;
            for (key, value) in &response.outputs {
                writeln!(output, "   {} = {}", key, value)?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Convenience methods using standard I/O
    // =========================================================================

    pub fn prompt(&self, proposal: &Proposal<'_>) -> Result<Decision> {
        let stdin = io::stdin();
        let mut input = stdin.lock();
        let mut output = io::stdout();
        self.prompt_with_io(proposal, &mut input, &mut output)
    }

    pub fn show_discarded(&self) {
        let _ = self.show_discarded_with_io(&mut io::stdout());
    }

    pub fn show_apply_result(&self, response: &ApplyResponse) {
        let _ = self.show_apply_result_with_io(response, &mut io::stdout());
    }
}
