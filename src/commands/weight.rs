use chrono::{Local, NaiveDate};
use clap::{Args, Subcommand};

use mealsync::models::WeightEntry;
use mealsync::SyncContext;

use super::meal::OutputFormat;

#[derive(Args)]
pub struct WeightCommand {
    #[command(subcommand)]
    pub command: WeightSubcommand,
}

#[derive(Subcommand)]
pub enum WeightSubcommand {
    /// Record a body weight measurement
    Record {
        /// Weight in kilograms
        kilograms: f64,

        /// Date (YYYY-MM-DD), defaults to today
        #[arg(long, short)]
        date: Option<String>,

        #[arg(long)]
        note: Option<String>,
    },

    /// List recorded weights
    List {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Delete a weight entry
    Delete {
        /// Weight entry ID
        id: String,
    },
}

impl WeightCommand {
    pub async fn run(&self, ctx: &SyncContext) -> Result<(), Box<dyn std::error::Error>> {
        let repo = ctx.weights();

        match &self.command {
            WeightSubcommand::Record {
                kilograms,
                date,
                note,
            } => {
                let date = match date {
                    Some(d) => NaiveDate::parse_from_str(d, "%Y-%m-%d")
                        .map_err(|_| format!("Invalid date format '{}'. Use YYYY-MM-DD.", d))?,
                    None => Local::now().date_naive(),
                };
                let mut entry = WeightEntry::new(date, *kilograms);
                if let Some(n) = note {
                    entry = entry.with_note(n);
                }

                let id = repo.record(&entry).await?;
                println!("Recorded {}", entry);
                println!("ID: {}", id);
            }
            WeightSubcommand::List { format } => {
                let entries = repo.list().await?;
                match format {
                    OutputFormat::Json => {
                        let rows: Vec<_> = entries
                            .iter()
                            .map(|(id, entry)| serde_json::json!({"id": id, "entry": entry}))
                            .collect();
                        println!("{}", serde_json::to_string_pretty(&rows)?);
                    }
                    OutputFormat::Text => {
                        if entries.is_empty() {
                            println!("No weights recorded.");
                        }
                        for (id, entry) in &entries {
                            println!("  {}  [{}]", entry, id);
                        }
                    }
                }
            }
            WeightSubcommand::Delete { id } => {
                repo.delete(id).await?;
                println!("Deleted weight entry {}", id);
            }
        }

        Ok(())
    }
}
