use clap::{Args, Subcommand};
use serde::Serialize;
use wakeytalky_core::schedule::{parse_weekday_list, upcoming, weekday_from_ordinal};
use wakeytalky_core::{Alarm, AlarmController, Task, TaskKind, TaskTarget, TimeOfDay};

use super::{now, open_controller, print_json, CliResult};

#[derive(Subcommand)]
pub enum AlarmAction {
    /// Create an alarm
    Add {
        /// Time of day, HH:MM
        time: String,
        #[command(flatten)]
        fields: AlarmFields,
    },
    /// Replace an alarm's settings; omitted flags keep their current value
    Edit {
        id: String,
        /// New time of day, HH:MM
        #[arg(long)]
        time: Option<String>,
        #[command(flatten)]
        fields: AlarmFields,
        /// Drop all tasks before adding --task ones
        #[arg(long)]
        clear_tasks: bool,
    },
    /// Delete an alarm
    Remove { id: String },
    /// Enable an alarm
    Enable { id: String },
    /// Disable an alarm
    Disable { id: String },
    /// List alarms
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one alarm as JSON
    Show { id: String },
    /// Upcoming trigger times
    Next {
        /// Limit to one alarm
        id: Option<String>,
        /// How many triggers to list per alarm
        #[arg(long, default_value = "1")]
        count: usize,
    },
}

#[derive(Args, Default)]
pub struct AlarmFields {
    /// What the alarm is for, e.g. "Gym"
    #[arg(long)]
    label: Option<String>,
    /// Active days: "mon,wed,fri", "weekdays", "weekends", "daily" or "once"
    #[arg(long)]
    days: Option<String>,
    /// Minutes between snoozes
    #[arg(long)]
    snooze_interval: Option<u32>,
    /// Maximum number of snoozes
    #[arg(long)]
    max_snooze: Option<u32>,
    /// Snoozes after which tasks must be done before dismissal
    #[arg(long)]
    tasks_after: Option<u32>,
    /// Turn snoozing off
    #[arg(long, conflicts_with = "snooze")]
    no_snooze: bool,
    /// Turn snoozing back on
    #[arg(long)]
    snooze: bool,
    /// Task as kind:target, e.g. "steps:500" or "photo:toothbrush" (repeatable)
    #[arg(long = "task")]
    tasks: Vec<String>,
}

impl AlarmFields {
    fn apply(self, alarm: &mut Alarm) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(label) = self.label {
            alarm.label = label;
        }
        if let Some(days) = self.days {
            alarm.active_days = parse_weekday_list(&days)?.into_iter().collect();
        }
        if let Some(minutes) = self.snooze_interval {
            alarm.snooze_interval_minutes = minutes;
        }
        if let Some(max) = self.max_snooze {
            alarm.max_snooze_count = max;
        }
        if let Some(after) = self.tasks_after {
            alarm.task_required_after_snoozes = after;
        }
        if self.no_snooze {
            alarm.snooze_enabled = false;
        }
        if self.snooze {
            alarm.snooze_enabled = true;
        }
        for raw in &self.tasks {
            alarm.tasks.push(parse_task(raw)?);
        }
        Ok(())
    }
}

/// `kind:target`. Photo tasks take a description, the rest a number.
fn parse_task(raw: &str) -> Result<Task, String> {
    let (kind, target) = raw
        .split_once(':')
        .ok_or_else(|| format!("task must be kind:target, got '{raw}'"))?;
    let kind: TaskKind = kind.parse()?;
    let target = match kind {
        TaskKind::Photo => TaskTarget::Description(target.trim().to_string()),
        _ => TaskTarget::Count(
            target
                .trim()
                .parse()
                .map_err(|_| format!("task target for {kind:?} must be a number, got '{target}'"))?,
        ),
    };
    Ok(Task::new(kind, target))
}

#[derive(Serialize)]
struct NextTrigger<'a> {
    alarm_id: &'a str,
    label: &'a str,
    at: Vec<chrono::NaiveDateTime>,
}

fn describe_days(alarm: &Alarm) -> String {
    if alarm.is_one_shot() {
        return "once".into();
    }
    alarm
        .active_days
        .iter()
        .filter_map(|d| weekday_from_ordinal(*d))
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn require<'a>(controller: &'a AlarmController, id: &str) -> Result<&'a Alarm, String> {
    controller.alarm(id).ok_or_else(|| format!("alarm not found: {id}"))
}

pub async fn run(action: AlarmAction) -> CliResult {
    let now = now();
    let (mut controller, _timers) = open_controller(now).await?;

    match action {
        AlarmAction::Add { time, fields } => {
            let time: TimeOfDay = time.parse()?;
            let mut alarm = controller.new_alarm("", time, []);
            fields.apply(&mut alarm)?;
            let id = controller.add_alarm(alarm, now).await?;
            print_json(require(&controller, &id)?)?;
        }
        AlarmAction::Edit {
            id,
            time,
            fields,
            clear_tasks,
        } => {
            let mut edited = require(&controller, &id)?.clone();
            if let Some(time) = time {
                edited.time = time.parse()?;
            }
            if clear_tasks {
                edited.tasks.clear();
            }
            fields.apply(&mut edited)?;
            controller.update_alarm(&id, edited, now).await?;
            print_json(require(&controller, &id)?)?;
        }
        AlarmAction::Remove { id } => {
            let removed = controller.remove_alarm(&id, now).await?;
            println!("removed {} ({})", removed.id, removed.time);
        }
        AlarmAction::Enable { id } => {
            controller.set_enabled(&id, true, now).await?;
            print_json(require(&controller, &id)?)?;
        }
        AlarmAction::Disable { id } => {
            controller.set_enabled(&id, false, now).await?;
            print_json(require(&controller, &id)?)?;
        }
        AlarmAction::List { json } => {
            let alarms: Vec<&Alarm> = controller.alarms().collect();
            if json {
                print_json(&alarms)?;
            } else if alarms.is_empty() {
                println!("no alarms");
            } else {
                for alarm in alarms {
                    let next = controller
                        .next_trigger(&alarm.id, now)?
                        .map(|at| at.format("%a %Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "disabled".into());
                    println!(
                        "{}  {}  {:<16} {:<20} tasks:{}  next: {}",
                        alarm.id,
                        alarm.time,
                        describe_days(alarm),
                        alarm.label,
                        alarm.tasks.len(),
                        next
                    );
                }
            }
        }
        AlarmAction::Show { id } => {
            print_json(require(&controller, &id)?)?;
        }
        AlarmAction::Next { id, count } => {
            let mut out = Vec::new();
            for alarm in controller.alarms() {
                if !alarm.enabled || id.as_deref().is_some_and(|id| id != alarm.id) {
                    continue;
                }
                out.push(NextTrigger {
                    alarm_id: &alarm.id,
                    label: &alarm.label,
                    at: upcoming(alarm, now, count)?,
                });
            }
            out.sort_by_key(|n| n.at.first().copied());
            print_json(&out)?;
        }
    }

    controller.flush().await?;
    Ok(())
}
