use chrono::{Local, NaiveDate};
use clap::{Args, Subcommand, ValueEnum};

use mealsync::clock::Clock;
use mealsync::db::MealLogEntry;
use mealsync::models::{FoodItem, MealLog, MealType};
use mealsync::SyncContext;

#[derive(Clone, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Args)]
pub struct LogCommand {
    #[command(subcommand)]
    pub command: LogSubcommand,
}

#[derive(Subcommand)]
pub enum LogSubcommand {
    /// Start a new meal log
    Create {
        /// Date (YYYY-MM-DD), defaults to today
        #[arg(long, short)]
        date: Option<String>,

        /// Meal type (breakfast, lunch, dinner, snack)
        #[arg(long = "type", short = 't', value_name = "TYPE")]
        meal_type: String,

        /// Add notes to the log
        #[arg(long)]
        notes: Option<String>,
    },

    /// Add a food item to a meal log
    AddItem {
        /// Meal log ID
        log_id: String,

        /// Food name
        #[arg(long)]
        name: String,

        /// Calories (kcal)
        #[arg(long)]
        calories: f64,

        /// Protein (g)
        #[arg(long, default_value = "0")]
        protein: f64,

        /// Carbohydrates (g)
        #[arg(long, default_value = "0")]
        carbs: f64,

        /// Fat (g)
        #[arg(long, default_value = "0")]
        fat: f64,
    },

    /// Change a food item in a meal log
    EditItem {
        /// Meal log ID
        log_id: String,

        /// Food item ID
        item_id: String,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        calories: Option<f64>,

        #[arg(long)]
        protein: Option<f64>,

        #[arg(long)]
        carbs: Option<f64>,

        #[arg(long)]
        fat: Option<f64>,
    },

    /// Remove a food item from a meal log
    RemoveItem {
        /// Meal log ID
        log_id: String,

        /// Food item ID
        item_id: String,
    },

    /// Delete a meal log
    Delete {
        /// Meal log ID
        log_id: String,
    },

    /// Show a meal log with its items
    Show {
        /// Meal log ID
        log_id: String,

        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// View meal history
    List {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,

        /// Start date (YYYY-MM-DD), defaults to 7 days ago
        #[arg(long)]
        from: Option<String>,

        /// End date (YYYY-MM-DD), defaults to today
        #[arg(long)]
        to: Option<String>,
    },
}

impl LogCommand {
    pub async fn run(&self, ctx: &SyncContext) -> Result<(), Box<dyn std::error::Error>> {
        let repo = ctx.meal_logs();

        match &self.command {
            LogSubcommand::Create {
                date,
                meal_type,
                notes,
            } => {
                let date = match date {
                    Some(d) => parse_date(d)?,
                    None => Local::now().date_naive(),
                };
                let meal_type: MealType = meal_type.parse().map_err(|e: String| e)?;

                let mut log = MealLog::new(date, meal_type);
                if let Some(n) = notes {
                    log = log.with_notes(n);
                }

                let created = repo.create(log).await?;
                println!("Created meal log:");
                println!();
                print_log_details(&created);
            }
            LogSubcommand::AddItem {
                log_id,
                name,
                calories,
                protein,
                carbs,
                fat,
            } => {
                let item = FoodItem::new(name, *calories, ctx.clock().now())
                    .with_macros(*protein, *carbs, *fat);
                let added = repo.add_item(log_id, item).await?;
                println!("Added '{}' ({} kcal)", added.name, added.calories);
                println!("Item ID: {}", added.id);
            }
            LogSubcommand::EditItem {
                log_id,
                item_id,
                name,
                calories,
                protein,
                carbs,
                fat,
            } => {
                let changed = repo
                    .edit_item(log_id, item_id, |item| {
                        if let Some(n) = name {
                            item.name = n.clone();
                        }
                        if let Some(c) = calories {
                            item.calories = *c;
                        }
                        if let Some(p) = protein {
                            item.protein_g = *p;
                        }
                        if let Some(c) = carbs {
                            item.carbs_g = *c;
                        }
                        if let Some(f) = fat {
                            item.fat_g = *f;
                        }
                    })
                    .await?;
                if !changed {
                    return Err(format!("Item not found: {}", item_id).into());
                }
                println!("Updated item {}", item_id);
            }
            LogSubcommand::RemoveItem { log_id, item_id } => {
                if !repo.remove_item(log_id, item_id).await? {
                    return Err(format!("Item not found: {}", item_id).into());
                }
                println!("Removed item {}", item_id);
            }
            LogSubcommand::Delete { log_id } => {
                repo.delete(log_id).await?;
                println!("Deleted meal log {}", log_id);
            }
            LogSubcommand::Show { log_id, format } => {
                let entry = repo
                    .get(log_id)
                    .await?
                    .ok_or_else(|| format!("Meal log not found: {}", log_id))?;
                match format {
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entry)?),
                    OutputFormat::Text => print_log_details(&entry),
                }
            }
            LogSubcommand::List { format, from, to } => {
                let to_date = match to {
                    Some(d) => parse_date(d)?,
                    None => Local::now().date_naive(),
                };
                let from_date = match from {
                    Some(d) => parse_date(d)?,
                    None => to_date - chrono::Duration::days(7),
                };

                let entries = repo.list_range(from_date, to_date).await?;
                if entries.is_empty() {
                    println!("No meal history found for {} to {}", from_date, to_date);
                    return Ok(());
                }

                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&entries)?);
                    }
                    OutputFormat::Text => print_history(&entries),
                }
            }
        }

        Ok(())
    }
}

fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| format!("Invalid date format '{}'. Use YYYY-MM-DD.", s))
}

fn print_history(entries: &[MealLogEntry]) {
    let mut current_date: Option<NaiveDate> = None;

    for entry in entries {
        let log = &entry.log;
        // Print date header when it changes
        if current_date != Some(log.date) {
            if current_date.is_some() {
                println!();
            }
            println!("{}", log.date);
            println!("{}", "-".repeat(10));
            current_date = Some(log.date);
        }

        let names: Vec<&str> = log.live_items().map(|i| i.name.as_str()).collect();
        let items_str = if names.is_empty() {
            String::new()
        } else {
            format!(": {}", names.join(", "))
        };
        let pending = if entry.pending_sync { " *" } else { "" };

        println!(
            "  {:10} {:>6.0} kcal{}{}",
            log.meal_type, log.totals.calories, items_str, pending
        );
    }

    println!("\nTotal: {} meal(s)", entries.len());
}

fn print_log_details(entry: &MealLogEntry) {
    let log = &entry.log;
    println!("  Date: {}", log.date);
    println!("  Meal: {}", log.meal_type);
    if log.totals.item_count > 0 {
        println!("  Items:");
        for item in log.live_items() {
            println!("    - {} ({} kcal) [{}]", item.name, item.calories, item.id);
        }
    }
    println!(
        "  Totals: {} kcal, {}g protein, {}g carbs, {}g fat",
        log.totals.calories, log.totals.protein_g, log.totals.carbs_g, log.totals.fat_g
    );
    if let Some(n) = &log.notes {
        println!("  Notes: {}", n);
    }
    println!();
    println!("Log ID: {} (v{}{})", entry.id, entry.version, if entry.pending_sync {
        ", not yet synced"
    } else {
        ""
    });
}
