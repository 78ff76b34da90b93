use std::collections::VecDeque;
use std::io::{self, BufRead, IsTerminal, Write};

use anyhow::{Context, Result, bail};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::CliError;

/// Result of anything the user can back out of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Value(T),
    Cancelled,
}

impl<T> Outcome<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Value(v) => Outcome::Value(f(v)),
            Outcome::Cancelled => Outcome::Cancelled,
        }
    }

    /// Turn a cancelled prompt into a `CliError::Cancelled`.
    pub fn or_cancelled(self) -> Result<T, CliError> {
        match self {
            Outcome::Value(v) => Ok(v),
            Outcome::Cancelled => Err(CliError::Cancelled),
        }
    }
}

pub trait Prompter: Send + Sync {
    fn is_interactive(&self) -> bool;
    fn input(&self, label: &str, default: Option<&str>) -> Result<Outcome<String>>;
    fn confirm(&self, label: &str, default_yes: bool) -> Result<Outcome<bool>>;
    fn select(&self, label: &str, options: &[String]) -> Result<Outcome<usize>>;
    fn multi_select(&self, label: &str, options: &[String]) -> Result<Outcome<Vec<usize>>>;
}

/// Prompts on stderr, answers from stdin. EOF counts as cancellation.
#[derive(Debug, Default)]
pub struct TerminalPrompter;

impl TerminalPrompter {
    fn read_answer(&self, prompt: &str) -> Result<Option<String>> {
        let mut err = io::stderr();
        write!(err, "{prompt}").context("failed to write prompt")?;
        err.flush().context("failed to flush prompt")?;
        let mut buffer = String::new();
        let read = io::stdin()
            .lock()
            .read_line(&mut buffer)
            .context("failed to read prompt response")?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(buffer.trim().to_string()))
    }
}

impl Prompter for TerminalPrompter {
    fn is_interactive(&self) -> bool {
        io::stdin().is_terminal() && io::stderr().is_terminal()
    }

    fn input(&self, label: &str, default: Option<&str>) -> Result<Outcome<String>> {
        let prompt = match default {
            Some(d) if !d.is_empty() => format!("{label} [{d}]: "),
            _ => format!("{label}: "),
        };
        loop {
            let Some(answer) = self.read_answer(&prompt)? else {
                return Ok(Outcome::Cancelled);
            };
            if !answer.is_empty() {
                return Ok(Outcome::Value(answer));
            }
            if let Some(d) = default {
                return Ok(Outcome::Value(d.to_string()));
            }
        }
    }

    fn confirm(&self, label: &str, default_yes: bool) -> Result<Outcome<bool>> {
        let hint = if default_yes { "[Y/n]" } else { "[y/N]" };
        let Some(answer) = self.read_answer(&format!("{label} {hint} "))? else {
            return Ok(Outcome::Cancelled);
        };
        Ok(Outcome::Value(parse_yes_no(&answer, default_yes)))
    }

    fn select(&self, label: &str, options: &[String]) -> Result<Outcome<usize>> {
        if options.is_empty() {
            bail!("nothing to choose for {label}");
        }
        eprintln!("{label}");
        for (idx, option) in options.iter().enumerate() {
            eprintln!("  {}) {option}", idx + 1);
        }
        loop {
            let Some(answer) = self.read_answer("> ")? else {
                return Ok(Outcome::Cancelled);
            };
            match answer.parse::<usize>() {
                Ok(n) if (1..=options.len()).contains(&n) => return Ok(Outcome::Value(n - 1)),
                _ => eprintln!("enter a number between 1 and {}", options.len()),
            }
        }
    }

    fn multi_select(&self, label: &str, options: &[String]) -> Result<Outcome<Vec<usize>>> {
        eprintln!("{label} (comma separated, empty for all, `none` for none)");
        for (idx, option) in options.iter().enumerate() {
            eprintln!("  {}) {option}", idx + 1);
        }
        loop {
            let Some(answer) = self.read_answer("> ")? else {
                return Ok(Outcome::Cancelled);
            };
            match parse_selection(&answer, options.len()) {
                Some(picked) => return Ok(Outcome::Value(picked)),
                None => eprintln!("enter numbers between 1 and {}", options.len()),
            }
        }
    }
}

pub fn parse_yes_no(answer: &str, default_yes: bool) -> bool {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => true,
        "n" | "no" => false,
        _ => default_yes,
    }
}

fn parse_selection(answer: &str, len: usize) -> Option<Vec<usize>> {
    let answer = answer.trim();
    if answer.is_empty() {
        return Some((0..len).collect());
    }
    if answer.eq_ignore_ascii_case("none") {
        return Some(Vec::new());
    }
    let mut picked = Vec::new();
    for part in answer.split(',') {
        let n: usize = part.trim().parse().ok()?;
        if n == 0 || n > len {
            return None;
        }
        if !picked.contains(&(n - 1)) {
            picked.push(n - 1);
        }
    }
    Some(picked)
}

/// Used when stdin is not a terminal or `--yes`-style automation is wanted.
/// Anything that needs an answer fails fast; confirmations take their default.
#[derive(Debug, Default)]
pub struct NonInteractive;

impl Prompter for NonInteractive {
    fn is_interactive(&self) -> bool {
        false
    }

    fn input(&self, label: &str, default: Option<&str>) -> Result<Outcome<String>> {
        match default {
            Some(d) => Ok(Outcome::Value(d.to_string())),
            None => Err(CliError::Input(format!("{label} is required")).into()),
        }
    }

    fn confirm(&self, label: &str, default_yes: bool) -> Result<Outcome<bool>> {
        debug!(label, default_yes, "non-interactive confirm");
        Ok(Outcome::Value(default_yes))
    }

    fn select(&self, label: &str, _options: &[String]) -> Result<Outcome<usize>> {
        Err(CliError::Input(format!("{label}: selection requires an interactive terminal")).into())
    }

    fn multi_select(&self, _label: &str, options: &[String]) -> Result<Outcome<Vec<usize>>> {
        Ok(Outcome::Value((0..options.len()).collect()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedAnswer {
    Text(String),
    Yes,
    No,
    Choice(usize),
    Choices(Vec<usize>),
    Cancel,
}

/// Replays canned answers in order; used by tests to drive interactive flows.
#[derive(Debug, Default)]
pub struct ScriptedPrompter {
    answers: Mutex<VecDeque<ScriptedAnswer>>,
    asked: Mutex<Vec<String>>,
}

impl ScriptedPrompter {
    pub fn new(answers: impl IntoIterator<Item = ScriptedAnswer>) -> Self {
        Self {
            answers: Mutex::new(answers.into_iter().collect()),
            asked: Mutex::new(Vec::new()),
        }
    }

    pub fn asked(&self) -> Vec<String> {
        self.asked.lock().clone()
    }

    pub fn remaining(&self) -> usize {
        self.answers.lock().len()
    }

    fn next(&self, label: &str) -> Result<ScriptedAnswer> {
        self.asked.lock().push(label.to_string());
        self.answers
            .lock()
            .pop_front()
            .with_context(|| format!("no scripted answer for `{label}`"))
    }
}

impl Prompter for ScriptedPrompter {
    fn is_interactive(&self) -> bool {
        true
    }

    fn input(&self, label: &str, default: Option<&str>) -> Result<Outcome<String>> {
        match self.next(label)? {
            ScriptedAnswer::Text(text) if text.is_empty() => Ok(Outcome::Value(
                default.map(str::to_string).unwrap_or_default(),
            )),
            ScriptedAnswer::Text(text) => Ok(Outcome::Value(text)),
            ScriptedAnswer::Cancel => Ok(Outcome::Cancelled),
            other => bail!("expected text for `{label}`, script had {other:?}"),
        }
    }

    fn confirm(&self, label: &str, _default_yes: bool) -> Result<Outcome<bool>> {
        match self.next(label)? {
            ScriptedAnswer::Yes => Ok(Outcome::Value(true)),
            ScriptedAnswer::No => Ok(Outcome::Value(false)),
            ScriptedAnswer::Cancel => Ok(Outcome::Cancelled),
            other => bail!("expected yes/no for `{label}`, script had {other:?}"),
        }
    }

    fn select(&self, label: &str, options: &[String]) -> Result<Outcome<usize>> {
        match self.next(label)? {
            ScriptedAnswer::Choice(idx) if idx < options.len() => Ok(Outcome::Value(idx)),
            ScriptedAnswer::Cancel => Ok(Outcome::Cancelled),
            other => bail!("invalid selection for `{label}`: {other:?}"),
        }
    }

    fn multi_select(&self, label: &str, options: &[String]) -> Result<Outcome<Vec<usize>>> {
        match self.next(label)? {
            ScriptedAnswer::Choices(picked) if picked.iter().all(|i| *i < options.len()) => {
                Ok(Outcome::Value(picked))
            }
            ScriptedAnswer::Cancel => Ok(Outcome::Cancelled),
            other => bail!("invalid selection for `{label}`: {other:?}"),
        }
    }
}

/// Describes a value that may come from a flag, an env var, or a prompt.
#[derive(Debug, Clone)]
pub struct PromptSpec<'a> {
    pub label: &'a str,
    pub flag: &'a str,
    pub default: Option<String>,
}

impl<'a> PromptSpec<'a> {
    pub fn new(label: &'a str, flag: &'a str) -> Self {
        Self {
            label,
            flag,
            default: None,
        }
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }
}

/// Flag, then environment variable, then prompt (interactive only), then default.
pub fn resolve(
    flag: Option<&str>,
    env_var: Option<&str>,
    spec: &PromptSpec<'_>,
    prompter: &dyn Prompter,
) -> Result<Outcome<String>> {
    if let Some(value) = flag
        && !value.trim().is_empty()
    {
        return Ok(Outcome::Value(value.to_string()));
    }
    if let Some(var) = env_var
        && let Ok(value) = std::env::var(var)
        && !value.trim().is_empty()
    {
        return Ok(Outcome::Value(value));
    }
    if prompter.is_interactive() {
        return prompter.input(spec.label, spec.default.as_deref());
    }
    match &spec.default {
        Some(d) => Ok(Outcome::Value(d.clone())),
        None => Err(CliError::Input(format!("missing required flag {}", spec.flag)).into()),
    }
}

/// Stages every interactive command walks through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Resolve,
    Prompt,
    Confirm,
    Execute,
    Render,
}

#[derive(Debug, PartialEq, Eq)]
pub enum FlowResult<T> {
    Completed(T),
    Declined,
    Cancelled,
}

/// An interactive command split into stages. Only `execute` and `render`
/// are mandatory; the other stages default to "nothing to do".
pub trait Flow {
    type Output;

    fn resolve(&mut self, _prompter: &dyn Prompter) -> Result<Outcome<()>> {
        Ok(Outcome::Value(()))
    }

    fn prompt(&mut self, _prompter: &dyn Prompter) -> Result<Outcome<()>> {
        Ok(Outcome::Value(()))
    }

    fn confirm(&mut self, _prompter: &dyn Prompter) -> Result<Outcome<bool>> {
        Ok(Outcome::Value(true))
    }

    fn execute(&mut self) -> Result<Self::Output>;

    fn render(&self, output: &Self::Output) -> Result<()>;
}

pub fn run_flow<F: Flow>(flow: &mut F, prompter: &dyn Prompter) -> Result<FlowResult<F::Output>> {
    let mut stage = Stage::Resolve;
    let mut output = None;
    loop {
        debug!(?stage, "flow stage");
        stage = match stage {
            Stage::Resolve => match flow.resolve(prompter)? {
                Outcome::Value(()) => Stage::Prompt,
                Outcome::Cancelled => return Ok(FlowResult::Cancelled),
            },
            Stage::Prompt => match flow.prompt(prompter)? {
                Outcome::Value(()) => Stage::Confirm,
                Outcome::Cancelled => return Ok(FlowResult::Cancelled),
            },
            Stage::Confirm => match flow.confirm(prompter)? {
                Outcome::Value(true) => Stage::Execute,
                Outcome::Value(false) => return Ok(FlowResult::Declined),
                Outcome::Cancelled => return Ok(FlowResult::Cancelled),
            },
            Stage::Execute => {
                output = Some(flow.execute()?);
                Stage::Render
            }
            Stage::Render => {
                let Some(result) = output.take() else {
                    bail!("flow reached render without executing");
                };
                flow.render(&result)?;
                return Ok(FlowResult::Completed(result));
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DeleteThing {
        executed: bool,
    }

    impl Flow for DeleteThing {
        type Output = &'static str;

        fn confirm(&mut self, prompter: &dyn Prompter) -> Result<Outcome<bool>> {
            prompter.confirm("Delete thing?", false)
        }

        fn execute(&mut self) -> Result<Self::Output> {
            self.executed = true;
            Ok("deleted")
        }

        fn render(&self, _output: &Self::Output) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn declined_confirmation_skips_execute() {
        let prompter = ScriptedPrompter::new([ScriptedAnswer::No]);
        let mut flow = DeleteThing { executed: false };
        assert_eq!(run_flow(&mut flow, &prompter).unwrap(), FlowResult::Declined);
        assert!(!flow.executed);
    }

    #[test]
    fn accepted_flow_executes_and_renders() {
        let prompter = ScriptedPrompter::new([ScriptedAnswer::Yes]);
        let mut flow = DeleteThing { executed: false };
        assert_eq!(
            run_flow(&mut flow, &prompter).unwrap(),
            FlowResult::Completed("deleted")
        );
        assert_eq!(prompter.asked(), vec!["Delete thing?".to_string()]);
    }

    #[test]
    fn cancelled_prompt_stops_flow() {
        let prompter = ScriptedPrompter::new([ScriptedAnswer::Cancel]);
        let mut flow = DeleteThing { executed: false };
        assert_eq!(run_flow(&mut flow, &prompter).unwrap(), FlowResult::Cancelled);
    }

    #[test]
    fn resolve_prefers_flag_then_prompt() {
        let prompter = ScriptedPrompter::new([ScriptedAnswer::Text("typed".into())]);
        let spec = PromptSpec::new("Room name", "--room");
        let from_flag = resolve(Some("flagged"), None, &spec, &prompter).unwrap();
        assert_eq!(from_flag, Outcome::Value("flagged".into()));
        let from_prompt = resolve(None, None, &spec, &prompter).unwrap();
        assert_eq!(from_prompt, Outcome::Value("typed".into()));
    }

    #[test]
    fn non_interactive_missing_value_fails_fast() {
        let spec = PromptSpec::new("Room name", "--room");
        let err = resolve(None, None, &spec, &NonInteractive).unwrap_err();
        assert!(err.to_string().contains("--room"));
        let defaulted = resolve(None, None, &spec.with_default("lobby"), &NonInteractive).unwrap();
        assert_eq!(defaulted, Outcome::Value("lobby".into()));
    }

    #[test]
    fn selection_parsing() {
        assert_eq!(parse_selection("", 3), Some(vec![0, 1, 2]));
        assert_eq!(parse_selection("none", 3), Some(vec![]));
        assert_eq!(parse_selection("3, 1,3", 3), Some(vec![2, 0]));
        assert_eq!(parse_selection("4", 3), None);
        assert!(parse_yes_no(" YES ", false));
        assert!(!parse_yes_no("", false));
    }
}
