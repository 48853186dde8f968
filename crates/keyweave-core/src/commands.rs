//! Command-line parsing and the keyboard/mouse/control command layer.
//!
//! A substituted command line such as `press,ctrl+c,0.2` is parsed into a
//! [`ScriptCommand`] and then performed against an [`InputDriver`]. Parsing
//! is separate from performing so that the linter can check lines without
//! touching a driver.
//!
//! `echo` and `input` need the run log, the host and the variable context,
//! so [`ScriptCommand::perform`] leaves them to the executor.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::driver::{InputDriver, Key, MouseButton};
use crate::error::CommandError;

/// Every command name the dispatcher understands, lower-case.
pub const KNOWN_COMMANDS: &[&str] = &[
    "press", "hotkey", "type", "click", "move", "drag", "scroll", "on", "off", "lmc", "rmc",
    "mmc", "wait", "echo", "input", "input_var",
];

/// Default per-character delay for `type`, before speed scaling.
pub const DEFAULT_TYPE_DELAY: Duration = Duration::from_millis(30);

const CLICK_HOLD: Duration = Duration::from_millis(50);
const DRAG_SETTLE: Duration = Duration::from_millis(50);
const DRAG_STEP: Duration = Duration::from_millis(10);
const DRAG_STEPS: i32 = 10;

/// Prompt used by `input_var` when the line gives none.
const DEFAULT_PROMPT: &str = "Enter value";

/// A parsed command line.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptCommand {
    Press { keys: Vec<Key>, seconds: f64 },
    Hotkey { keys: Vec<Key> },
    Type { text: String },
    Click { x: i32, y: i32, button: MouseButton },
    /// `lmc`/`rmc`/`mmc`: click where the pointer already is.
    ClickHere { button: MouseButton },
    Move { x: i32, y: i32 },
    Drag { from: (i32, i32), to: (i32, i32) },
    /// Positive scrolls up.
    Scroll { amount: i32 },
    ButtonDown { button: MouseButton },
    ButtonUp { button: MouseButton },
    Wait { seconds: f64 },
    Echo { message: String },
    /// Ask the host for a value. Without a `$variable` the answer is
    /// discarded.
    Input { prompt: String, variable: Option<String> },
}

/// What a command needs to run.
pub struct CommandEnv<'a> {
    pub driver: &'a dyn InputDriver,
    /// Divides every timed hold, wait and typing delay. Always positive.
    pub speed: f64,
    pub type_delay: Duration,
    pub cancel: &'a CancellationToken,
}

struct Args<'a> {
    command: &'static str,
    line: &'a str,
    parts: Vec<&'a str>,
}

impl<'a> Args<'a> {
    fn get(&self, index: usize) -> Option<&'a str> {
        self.parts.get(index).copied().filter(|s| !s.is_empty())
    }

    fn required(&self, index: usize, what: &'static str) -> Result<&'a str, CommandError> {
        self.get(index).ok_or(CommandError::MissingArgument {
            command: self.command,
            what,
        })
    }

    /// Everything from `index` on, commas preserved.
    fn rest(&self, index: usize) -> String {
        self.parts.get(index..).map(|p| p.join(",")).unwrap_or_default()
    }

    /// The line after the first comma as written, interior spacing kept.
    fn raw_rest(&self) -> String {
        self.line
            .split_once(',')
            .map(|(_, rest)| rest.trim_start().to_string())
            .unwrap_or_default()
    }

    fn invalid(&self, what: &'static str, value: &str) -> CommandError {
        CommandError::InvalidArgument {
            command: self.command,
            what,
            value: value.to_string(),
        }
    }

    fn seconds(&self, index: usize, what: &'static str) -> Result<f64, CommandError> {
        let raw = self.required(index, what)?;
        match raw.parse::<f64>() {
            Ok(v) if v.is_finite() && v >= 0.0 => Ok(v),
            _ => Err(self.invalid(what, raw)),
        }
    }

    /// Coordinates accept `150` as well as a computed `150.0` or `75.5`.
    fn coord(&self, index: usize, what: &'static str) -> Result<i32, CommandError> {
        let raw = self.required(index, what)?;
        if let Ok(v) = raw.parse::<i32>() {
            return Ok(v);
        }
        match raw.parse::<f64>() {
            Ok(v) if v.is_finite() && v.abs() <= f64::from(i32::MAX) => Ok(v.round() as i32),
            _ => Err(self.invalid(what, raw)),
        }
    }

    fn keys(&self, index: usize) -> Result<Vec<Key>, CommandError> {
        let raw = self.required(index, "keys")?;
        Key::parse_combo(raw).map_err(|bad| self.invalid("key", &bad))
    }

    fn button(&self, index: usize) -> Result<MouseButton, CommandError> {
        let raw = self.required(index, "button")?;
        MouseButton::from_name(raw).ok_or_else(|| self.invalid("button", raw))
    }
}

fn unquote(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(s)
}

/// Lower-cased first token of a command line.
pub fn command_name(line: &str) -> String {
    line.split(',').next().unwrap_or("").trim().to_lowercase()
}

impl ScriptCommand {
    /// Parse a substituted command line.
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let name = command_name(line);
        let command = KNOWN_COMMANDS
            .iter()
            .copied()
            .find(|known| *known == name)
            .ok_or(CommandError::UnknownCommand(name.clone()))?;
        let args = Args {
            command,
            line,
            parts: line.split(',').map(str::trim).collect(),
        };

        let cmd = match command {
            "press" => ScriptCommand::Press {
                keys: args.keys(1)?,
                seconds: args.seconds(2, "duration")?,
            },
            "hotkey" => ScriptCommand::Hotkey { keys: args.keys(1)? },
            "type" => {
                args.required(1, "text")?;
                ScriptCommand::Type {
                    text: args.raw_rest(),
                }
            }
            "click" => ScriptCommand::Click {
                x: args.coord(1, "x coordinate")?,
                y: args.coord(2, "y coordinate")?,
                button: match args.get(3) {
                    Some(_) => args.button(3)?,
                    None => MouseButton::Left,
                },
            },
            "lmc" | "rmc" | "mmc" => ScriptCommand::ClickHere {
                button: MouseButton::from_name(command).unwrap_or(MouseButton::Left),
            },
            "move" => ScriptCommand::Move {
                x: args.coord(1, "x coordinate")?,
                y: args.coord(2, "y coordinate")?,
            },
            "drag" => ScriptCommand::Drag {
                from: (args.coord(1, "start x")?, args.coord(2, "start y")?),
                to: (args.coord(3, "end x")?, args.coord(4, "end y")?),
            },
            "scroll" => {
                let direction = args.required(1, "direction")?;
                let raw = args.required(2, "amount")?;
                let amount: i32 = raw.parse().map_err(|_| args.invalid("amount", raw))?;
                match direction.to_ascii_lowercase().as_str() {
                    "up" => ScriptCommand::Scroll { amount },
                    "down" => ScriptCommand::Scroll {
                        amount: amount.saturating_neg(),
                    },
                    _ => return Err(args.invalid("direction", direction)),
                }
            }
            "on" => ScriptCommand::ButtonDown { button: args.button(1)? },
            "off" => ScriptCommand::ButtonUp { button: args.button(1)? },
            "wait" => ScriptCommand::Wait {
                seconds: args.seconds(1, "duration")?,
            },
            "echo" => ScriptCommand::Echo { message: args.rest(1) },
            "input" => ScriptCommand::Input {
                prompt: unquote(args.required(1, "prompt")?).to_string(),
                variable: args.get(2).map(str::to_string),
            },
            "input_var" => ScriptCommand::Input {
                variable: Some(args.required(1, "variable")?.to_string()),
                prompt: args
                    .get(2)
                    .map(|p| unquote(p).to_string())
                    .unwrap_or_else(|| DEFAULT_PROMPT.to_string()),
            },
            _ => return Err(CommandError::UnknownCommand(name)),
        };
        Ok(cmd)
    }

    /// Perform a keyboard, mouse or `wait` command.
    ///
    /// `echo` and `input` are no-ops here. A stop request cuts timed
    /// holds short, but keys and buttons pressed by this command are
    /// always released.
    pub async fn perform(&self, env: &CommandEnv<'_>) -> Result<(), CommandError> {
        let driver = env.driver;
        match self {
            ScriptCommand::Press { keys, seconds } => {
                press_keys(env, keys, Some(scaled(*seconds, env.speed))).await?;
            }
            ScriptCommand::Hotkey { keys } => press_keys(env, keys, None).await?,
            ScriptCommand::Type { text } => {
                let delay = scaled(env.type_delay.as_secs_f64(), env.speed);
                for c in text.chars() {
                    let key = Key::Char(c);
                    driver.key_down(key).await?;
                    driver.key_up(key).await?;
                    if !sleep_or_cancel(delay, env.cancel).await {
                        debug!("typing interrupted");
                        break;
                    }
                }
            }
            ScriptCommand::Click { x, y, button } => {
                driver.move_pointer(*x, *y).await?;
                click(env, *button).await?;
            }
            ScriptCommand::ClickHere { button } => click(env, *button).await?,
            ScriptCommand::Move { x, y } => driver.move_pointer(*x, *y).await?,
            ScriptCommand::Drag { from, to } => {
                driver.move_pointer(from.0, from.1).await?;
                sleep_or_cancel(DRAG_SETTLE, env.cancel).await;
                driver.button_down(MouseButton::Left).await?;
                sleep_or_cancel(DRAG_SETTLE, env.cancel).await;
                let mut result = Ok(());
                for step in 0..=DRAG_STEPS {
                    let x = interpolate(from.0, to.0, step);
                    let y = interpolate(from.1, to.1, step);
                    result = driver.move_pointer(x, y).await;
                    if result.is_err() || !sleep_or_cancel(DRAG_STEP, env.cancel).await {
                        break;
                    }
                }
                driver.button_up(MouseButton::Left).await?;
                result?;
                sleep_or_cancel(DRAG_SETTLE, env.cancel).await;
            }
            ScriptCommand::Scroll { amount } => driver.scroll(0, *amount).await?,
            ScriptCommand::ButtonDown { button } => driver.button_down(*button).await?,
            ScriptCommand::ButtonUp { button } => driver.button_up(*button).await?,
            ScriptCommand::Wait { seconds } => {
                sleep_or_cancel(scaled(*seconds, env.speed), env.cancel).await;
            }
            ScriptCommand::Echo { .. } | ScriptCommand::Input { .. } => {}
        }
        Ok(())
    }
}

async fn press_keys(
    env: &CommandEnv<'_>,
    keys: &[Key],
    hold: Option<Duration>,
) -> Result<(), CommandError> {
    let mut pressed = Vec::with_capacity(keys.len());
    let mut result = Ok(());
    for key in keys {
        if let Err(e) = env.driver.key_down(*key).await {
            result = Err(e);
            break;
        }
        pressed.push(*key);
    }
    if result.is_ok() {
        if let Some(hold) = hold {
            sleep_or_cancel(hold, env.cancel).await;
        }
    }
    for key in pressed.iter().rev() {
        env.driver.key_up(*key).await?;
    }
    result.map_err(CommandError::from)
}

async fn click(env: &CommandEnv<'_>, button: MouseButton) -> Result<(), CommandError> {
    env.driver.button_down(button).await?;
    sleep_or_cancel(CLICK_HOLD, env.cancel).await;
    env.driver.button_up(button).await?;
    Ok(())
}

/// Point `step` of [`DRAG_STEPS`] between `from` and `to`.
fn interpolate(from: i32, to: i32, step: i32) -> i32 {
    let (from, to) = (i64::from(from), i64::from(to));
    let point = from + (to - from) * i64::from(step) / i64::from(DRAG_STEPS);
    // always lies between the endpoints
    i32::try_from(point).unwrap_or(to as i32)
}

fn scaled(seconds: f64, speed: f64) -> Duration {
    Duration::try_from_secs_f64(seconds / speed).unwrap_or(Duration::MAX)
}

/// Sleep unless cancelled first. Returns `false` if cancelled.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::SpecialKey;
    use crate::dry_run::{DriverEvent, DryRunDriver};

    fn env<'a>(driver: &'a DryRunDriver, cancel: &'a CancellationToken) -> CommandEnv<'a> {
        CommandEnv {
            driver,
            speed: 1.0,
            type_delay: DEFAULT_TYPE_DELAY,
            cancel,
        }
    }

    #[test]
    fn test_parse_press_and_click() {
        assert_eq!(
            ScriptCommand::parse("Press, ctrl+c , 0.2").unwrap(),
            ScriptCommand::Press {
                keys: vec![Key::Special(SpecialKey::Ctrl), Key::Char('c')],
                seconds: 0.2,
            }
        );
        assert_eq!(
            ScriptCommand::parse("click,10,20,right").unwrap(),
            ScriptCommand::Click {
                x: 10,
                y: 20,
                button: MouseButton::Right
            }
        );
        assert_eq!(
            ScriptCommand::parse("click,10.4,20").unwrap(),
            ScriptCommand::Click {
                x: 10,
                y: 20,
                button: MouseButton::Left
            }
        );
    }

    #[test]
    fn test_parse_unknown_command() {
        let err = ScriptCommand::parse("foobar,1,2").unwrap_err();
        assert!(matches!(err, CommandError::UnknownCommand(ref n) if n == "foobar"));
    }

    #[test]
    fn test_parse_argument_errors() {
        assert!(matches!(
            ScriptCommand::parse("press,a").unwrap_err(),
            CommandError::MissingArgument { command: "press", .. }
        ));
        assert!(matches!(
            ScriptCommand::parse("wait,soon").unwrap_err(),
            CommandError::InvalidArgument { command: "wait", .. }
        ));
        assert!(matches!(
            ScriptCommand::parse("scroll,sideways,3").unwrap_err(),
            CommandError::InvalidArgument { what: "direction", .. }
        ));
        assert!(matches!(
            ScriptCommand::parse("hotkey,ctrl+bogus").unwrap_err(),
            CommandError::InvalidArgument { what: "key", .. }
        ));
    }

    #[test]
    fn test_parse_echo_keeps_commas() {
        assert_eq!(
            ScriptCommand::parse("echo,a, b,c").unwrap(),
            ScriptCommand::Echo {
                message: "a,b,c".into()
            }
        );
        assert_eq!(
            ScriptCommand::parse("echo").unwrap(),
            ScriptCommand::Echo {
                message: String::new()
            }
        );
    }

    #[test]
    fn test_parse_both_input_forms() {
        assert_eq!(
            ScriptCommand::parse("input,\"Your name\",$name").unwrap(),
            ScriptCommand::Input {
                prompt: "Your name".into(),
                variable: Some("$name".into())
            }
        );
        assert_eq!(
            ScriptCommand::parse("input_var,$n").unwrap(),
            ScriptCommand::Input {
                prompt: "Enter value".into(),
                variable: Some("$n".into())
            }
        );
    }

    #[test]
    fn test_scroll_direction_sign() {
        assert_eq!(
            ScriptCommand::parse("scroll,down,3").unwrap(),
            ScriptCommand::Scroll { amount: -3 }
        );
        assert_eq!(
            ScriptCommand::parse("scroll,down,-2147483648").unwrap(),
            ScriptCommand::Scroll { amount: i32::MAX }
        );
    }

    #[test]
    fn test_interpolate_extreme_coordinates() {
        assert_eq!(interpolate(i32::MIN, i32::MAX, 0), i32::MIN);
        assert_eq!(interpolate(i32::MIN, i32::MAX, DRAG_STEPS), i32::MAX);
        assert_eq!(interpolate(-2_000_000_000, 2_000_000_000, 5), 0);
        assert_eq!(interpolate(100, 0, 5), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_press_releases_in_reverse_order() {
        let driver = DryRunDriver::new();
        let cancel = CancellationToken::new();
        let cmd = ScriptCommand::parse("press,shift+a,0.5").unwrap();
        let start = tokio::time::Instant::now();
        cmd.perform(&env(&driver, &cancel)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(500));

        let shift = Key::Special(SpecialKey::Shift);
        let a = Key::Char('a');
        assert_eq!(
            driver.events(),
            vec![
                DriverEvent::KeyDown { key: shift },
                DriverEvent::KeyDown { key: a },
                DriverEvent::KeyUp { key: a },
                DriverEvent::KeyUp { key: shift },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_is_scaled_by_speed() {
        let driver = DryRunDriver::new();
        let cancel = CancellationToken::new();
        let mut env = env(&driver, &cancel);
        env.speed = 4.0;
        let start = tokio::time::Instant::now();
        ScriptCommand::Wait { seconds: 2.0 }.perform(&env).await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(500));
        assert!(elapsed < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_type_presses_each_character() {
        let driver = DryRunDriver::new();
        let cancel = CancellationToken::new();
        ScriptCommand::parse("type, Hello,  world")
            .unwrap()
            .perform(&env(&driver, &cancel))
            .await
            .unwrap();
        assert_eq!(driver.typed_text(), "Hello,  world");
    }

    #[tokio::test]
    async fn test_cancelled_press_still_releases() {
        let driver = DryRunDriver::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        ScriptCommand::parse("press,a,3600")
            .unwrap()
            .perform(&env(&driver, &cancel))
            .await
            .unwrap();
        assert_eq!(driver.events().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drag_interpolates_and_releases() {
        let driver = DryRunDriver::new();
        let cancel = CancellationToken::new();
        ScriptCommand::parse("drag,0,0,100,50")
            .unwrap()
            .perform(&env(&driver, &cancel))
            .await
            .unwrap();
        let events = driver.events();
        assert_eq!(events.first(), Some(&DriverEvent::Move { x: 0, y: 0 }));
        assert_eq!(
            events.last(),
            Some(&DriverEvent::ButtonUp {
                button: MouseButton::Left
            })
        );
        assert!(events.contains(&DriverEvent::Move { x: 50, y: 25 }));
        assert_eq!(driver.pointer_position().await.unwrap(), (100, 50));
    }
}
