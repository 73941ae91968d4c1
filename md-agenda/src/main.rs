use std::{
    fs,
    io::{self, BufRead, Write},
    path::PathBuf,
};

use anyhow::{Context, Result};
use chrono::{NaiveDate, Weekday};
use clap::{Args, Parser, Subcommand};
use md_agenda::agenda::{AgendaState, RangeType};
use md_agenda::config::{AgendaConfig, Backend};
use md_agenda::core::TodoRecord;
use md_agenda::log::DebugLog;
use md_agenda::parse_line;
use md_agenda::search::{LineSearch, refresh};
use md_agenda::view::{AgendaView, Clock, Effect, FixedClock, SystemClock, ViewKind};

#[derive(Debug, Parser)]
#[command(
    name = "md-agenda",
    about = "Agenda views over TODO headings in markdown files",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// TOML settings file (roots, week_start, default_range, debug, backend, ripgrep_path).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse raw `file:line:column:text` search lines and print the records.
    Parse(ParseArgs),

    /// Search root folders for TODO headings and print the records.
    Scan(ScanArgs),

    /// Render an agenda page. With --interactive, read command tokens from stdin.
    Agenda(AgendaArgs),
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// Files holding search output. Reads stdin when none are given.
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of one summary line per record.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct SearchArgs {
    /// Root folders to search. Overrides `roots` from the config file.
    roots: Vec<PathBuf>,
    /// Line search backend (ripgrep or builtin).
    #[arg(long)]
    backend: Option<Backend>,
}

#[derive(Debug, Args)]
struct ScanArgs {
    #[command(flatten)]
    search: SearchArgs,
    /// Emit JSON instead of one summary line per record.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct AgendaArgs {
    #[command(flatten)]
    search: SearchArgs,
    /// Range type: week, fortnight, month or year.
    #[arg(long)]
    range: Option<RangeType>,
    /// First day of the week (mon, sun, ...).
    #[arg(long)]
    week_start: Option<Weekday>,
    /// Use this date as today (YYYY-MM-DD).
    #[arg(long)]
    today: Option<NaiveDate>,
    /// Read command tokens (nextPage, gotoToday, open <line>, ...) from stdin.
    #[arg(long)]
    interactive: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => AgendaConfig::load(path)?,
        None => AgendaConfig::default(),
    };
    config.debug |= cli.verbose;
    let log = DebugLog::new(config.debug);

    match cli.command {
        Commands::Parse(args) => handle_parse(args, &log),
        Commands::Scan(args) => handle_scan(args, config, &log),
        Commands::Agenda(args) => handle_agenda(args, config, &log),
    }
}

fn handle_parse(args: ParseArgs, log: &DebugLog) -> Result<()> {
    let ParseArgs { inputs, json } = args;
    let lines = if inputs.is_empty() {
        io::stdin()
            .lock()
            .lines()
            .collect::<io::Result<Vec<_>>>()
            .context("reading stdin")?
    } else {
        read_input_lines(&inputs, log)?
    };

    let records: Vec<TodoRecord> = lines
        .iter()
        .filter(|line| !line.trim().is_empty())
        .map(|line| parse_line(line))
        .collect();
    print_records(&records, json)
}

fn handle_scan(args: ScanArgs, mut config: AgendaConfig, log: &DebugLog) -> Result<()> {
    let ScanArgs { search, json } = args;
    apply_search_args(&mut config, search);

    let line_search = config.line_search();
    let records = refresh(line_search.as_ref(), &config.roots, log)
        .context("refreshing TODO list")?;
    if records.is_empty() {
        eprintln!("No TODO headings found under the provided roots.");
        return Ok(());
    }
    print_records(&records, json)
}

fn handle_agenda(args: AgendaArgs, mut config: AgendaConfig, log: &DebugLog) -> Result<()> {
    let AgendaArgs {
        search,
        range,
        week_start,
        today,
        interactive,
    } = args;
    apply_search_args(&mut config, search);
    if let Some(range) = range {
        config.default_range = range;
    }
    if let Some(week_start) = week_start {
        config.week_start = week_start;
    }

    let clock: Box<dyn Clock> = match today {
        Some(date) => Box::new(FixedClock(date)),
        None => Box::new(SystemClock),
    };
    let line_search = config.line_search();
    let state = AgendaState::new(config.default_range, config.week_start, clock.today());
    let mut session = Session {
        view: ViewKind::Agenda(AgendaView::new(state)),
        search: line_search.as_ref(),
        roots: &config.roots,
        clock: clock.as_ref(),
        log,
    };
    session
        .view
        .refresh(session.search, session.roots, log)
        .context("refreshing TODO list")?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    if interactive {
        session.run(io::stdin().lock(), &mut out)
    } else {
        let page = session.view.render();
        writeln!(out, "{}", page.text())?;
        Ok(())
    }
}

/// An open agenda plus the collaborators it needs to answer commands.
struct Session<'a> {
    view: ViewKind,
    search: &'a dyn LineSearch,
    roots: &'a [PathBuf],
    clock: &'a dyn Clock,
    log: &'a DebugLog,
}

impl Session<'_> {
    fn run(&mut self, input: impl BufRead, out: &mut impl Write) -> Result<()> {
        self.write_page(out, None)?;
        for line in input.lines() {
            let line = line.context("reading command")?;
            let token = line.trim();
            if token.is_empty() {
                continue;
            }
            if matches!(token, "quit" | "q") {
                break;
            }
            if let Some(rest) = token.strip_prefix("open ") {
                self.write_location(out, rest, false)?;
                continue;
            }
            if let Some(rest) = token.strip_prefix("preview ") {
                self.write_location(out, rest, true)?;
                continue;
            }

            match self.view.handle_token(token, self.clock, self.log) {
                Effect::Unchanged => {}
                Effect::Render { focus } => self.write_page(out, focus)?,
                Effect::Refresh => {
                    match self.view.refresh(self.search, self.roots, self.log) {
                        Ok(count) => self.log.debug(format!("refreshed {count} record(s)")),
                        Err(err) => writeln!(out, "refresh failed, showing previous list: {err}")?,
                    }
                    self.write_page(out, None)?;
                }
            }
        }
        Ok(())
    }

    fn write_page(&mut self, out: &mut impl Write, focus: Option<NaiveDate>) -> Result<()> {
        writeln!(out, "== {} ==", self.view.heading())?;
        let page = self.view.render();
        for (idx, line) in page.lines.iter().enumerate() {
            writeln!(out, "{idx:>4} {line}")?;
        }
        if let Some(line) = focus.and_then(|day| page.line_of(day)) {
            writeln!(out, "cursor: {line}")?;
        }
        Ok(())
    }

    fn write_location(&self, out: &mut impl Write, arg: &str, preview: bool) -> Result<()> {
        let Ok(line) = arg.trim().parse::<usize>() else {
            writeln!(out, "not a line number: {arg}")?;
            return Ok(());
        };
        match self.view.record_at_line(line) {
            Some(record) if preview => {
                writeln!(out, "{}  {}", record.location, record.raw_line)?
            }
            Some(record) => writeln!(out, "{}", record.location)?,
            None => writeln!(out, "no TODO on line {line}")?,
        }
        Ok(())
    }
}

fn apply_search_args(config: &mut AgendaConfig, args: SearchArgs) {
    if !args.roots.is_empty() {
        config.roots = args.roots;
    }
    if config.roots.is_empty() {
        config.roots = vec![PathBuf::from(".")];
    }
    if let Some(backend) = args.backend {
        config.backend = backend;
    }
}

fn read_input_lines(inputs: &[PathBuf], log: &DebugLog) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    for path in inputs {
        log.debug(format!("reading search output {:?}", path));
        let text = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
        lines.extend(text.lines().map(str::to_string));
    }
    Ok(lines)
}

fn print_records(records: &[TodoRecord], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(records)?);
    } else {
        for record in records {
            println!("{record}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use md_agenda::search::WalkSearch;
    use std::io::Cursor;

    fn search_args(roots: Vec<PathBuf>, backend: Option<Backend>) -> SearchArgs {
        SearchArgs { roots, backend }
    }

    #[test]
    fn search_args_override_config() {
        let mut config = AgendaConfig {
            roots: vec![PathBuf::from("/notes")],
            ..AgendaConfig::default()
        };
        apply_search_args(&mut config, search_args(vec![], Some(Backend::Builtin)));
        assert_eq!(config.roots, vec![PathBuf::from("/notes")]);
        assert_eq!(config.backend, Backend::Builtin);

        apply_search_args(&mut config, search_args(vec![PathBuf::from("/work")], None));
        assert_eq!(config.roots, vec![PathBuf::from("/work")]);
        assert_eq!(config.backend, Backend::Builtin);
    }

    #[test]
    fn roots_default_to_current_directory() {
        let mut config = AgendaConfig::default();
        apply_search_args(&mut config, search_args(vec![], None));
        assert_eq!(config.roots, vec![PathBuf::from(".")]);
    }

    #[test]
    fn reads_search_output_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("hits.txt");
        fs::write(&path, "a.md:1:1:# TODO One\nb.md:2:1:# DONE Two\n").expect("write hits");

        let lines = read_input_lines(&[path], &DebugLog::default()).expect("read lines");
        assert_eq!(lines.len(), 2);
        assert_eq!(parse_line(&lines[1]).title, "Two");
    }

    #[test]
    fn interactive_session_pages_and_opens_records() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = tmp.path().join("todo.md");
        fs::write(&file, "# TODO Dentist @s(2024-03-04 14:00) @health\n").expect("write todo");

        let roots = vec![tmp.path().to_path_buf()];
        let search = WalkSearch::default();
        let clock = FixedClock(NaiveDate::from_ymd_opt(2024, 3, 6).unwrap());
        let log = DebugLog::default();
        let state = AgendaState::new(RangeType::Week, Weekday::Sun, clock.today());
        let mut session = Session {
            view: ViewKind::Agenda(AgendaView::new(state)),
            search: &search,
            roots: &roots,
            clock: &clock,
            log: &log,
        };
        session
            .view
            .refresh(session.search, session.roots, &log)
            .expect("refresh");

        let input = Cursor::new("open 2\nfrobnicate\nnextPage\ngotoToday\nopen 1\nquit\nnextPage\n");
        let mut out = Vec::new();
        session.run(input, &mut out).expect("run session");
        let out = String::from_utf8(out).expect("utf8");

        assert!(out.contains("== Agenda (week) 2024-03-03 .. 2024-03-09 =="));
        assert!(out.contains("   2    Dentist @health"));
        assert!(out.contains(&format!("{}:1:1", file.display())));
        assert!(out.contains("== Agenda (week) 2024-03-10 .. 2024-03-16 =="));
        assert!(out.contains("cursor: 3"));
        assert!(out.contains("no TODO on line 1"));
        // Everything after `quit` is ignored.
        assert_eq!(out.matches("== Agenda").count(), 3);
    }
}
