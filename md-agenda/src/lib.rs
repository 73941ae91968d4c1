//! Markdown agenda library.
//! Collects `# TODO` / `# DONE` headings found by a line search over markdown trees,
//! parses them into records, and lays them out over week, fortnight, month or year pages.

pub mod core {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Serialize};
    use std::{fmt, path::PathBuf};

    /* ------------------------------ Location ------------------------------ */

    /// Where a search hit came from. Set once at parse time.
    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct SourceLocation {
        pub file: PathBuf,
        /// 1-based.
        pub line: u32,
        /// 1-based.
        pub column: u32,
    }

    impl fmt::Display for SourceLocation {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}:{}:{}", self.file.display(), self.line, self.column)
        }
    }

    /* ------------------------------ Values ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(rename_all = "UPPERCASE")]
    pub enum TodoState {
        #[default]
        Todo,
        Done,
    }

    impl TodoState {
        pub fn keyword(self) -> &'static str {
            match self {
                TodoState::Todo => "TODO",
                TodoState::Done => "DONE",
            }
        }
    }

    impl fmt::Display for TodoState {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.keyword())
        }
    }

    /// A scheduled slot. `end` is only ever set together with `start`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct ScheduleWindow {
        pub start: Option<NaiveDateTime>,
        pub end: Option<NaiveDateTime>,
    }

    impl ScheduleWindow {
        pub const UNSET: ScheduleWindow = ScheduleWindow {
            start: None,
            end: None,
        };

        pub fn starting_at(start: NaiveDateTime) -> Self {
            Self {
                start: Some(start),
                end: None,
            }
        }

        pub fn between(start: NaiveDateTime, end: NaiveDateTime) -> Self {
            Self {
                start: Some(start),
                end: Some(end),
            }
        }

        pub fn is_set(&self) -> bool {
            self.start.is_some()
        }
    }

    /* ------------------------------ Entity ------------------------------ */

    /// One parsed TODO/DONE heading.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TodoRecord {
        pub location: SourceLocation,
        /// Text captured after the `file:line:column:` prefix.
        pub raw_line: String,
        pub title: String,
        pub state: TodoState,
        #[serde(default)]
        pub scheduled: ScheduleWindow,
        pub deadline: Option<NaiveDateTime>,
        /// Empty means unset.
        #[serde(default)]
        pub priority: String,
        /// Plain tags, each prefixed with `@`, in source order (duplicates kept).
        #[serde(default)]
        pub tags: Vec<String>,
    }

    impl TodoRecord {
        /// A record carrying only its location and title (the fallback for unmatched lines).
        pub fn new(location: SourceLocation, raw_line: impl Into<String>, title: impl Into<String>) -> Self {
            Self {
                location,
                raw_line: raw_line.into(),
                title: title.into(),
                state: TodoState::Todo,
                scheduled: ScheduleWindow::UNSET,
                deadline: None,
                priority: String::new(),
                tags: Vec::new(),
            }
        }

        pub fn scheduled_start(&self) -> Option<NaiveDateTime> {
            self.scheduled.start
        }

        pub fn scheduled_end(&self) -> Option<NaiveDateTime> {
            self.scheduled.end
        }

        pub fn has_priority(&self) -> bool {
            !self.priority.is_empty()
        }
    }

    impl fmt::Display for TodoRecord {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            fn opt(dt: Option<NaiveDateTime>) -> String {
                dt.map(|d| d.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "-".to_string())
            }
            write!(
                f,
                "[{}:{}] {} {} (ss={}, se={}, d={}, p={}, tags={})",
                self.location.file.display(),
                self.location.line,
                self.state,
                self.title,
                opt(self.scheduled.start),
                opt(self.scheduled.end),
                opt(self.deadline),
                self.priority,
                self.tags.join(",")
            )
        }
    }
}

pub mod parser {
    //! Parser for line-search output.
    //!
    //! Each line goes through two passes:
    //! - split the `file:line:column:text` prefix the search tool emits;
    //! - match the markdown heading (`## TODO title @tag @s(2024-03-01 9:00-10:30)`) and
    //!   classify its trailing `@tags`.
    //!
    //! Nothing here fails. Malformed input degrades to a TODO record whose title is the text.

    use crate::core::*;
    use chrono::{NaiveDate, NaiveTime};
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_while, take_while1},
        character::complete::{char, digit1},
        combinator::{all_consuming, map, map_res, opt},
        error::{VerboseError, VerboseErrorKind},
        sequence::{delimited, pair, preceded, tuple},
    };
    use std::path::PathBuf;

    const SCHEDULED_TAGS: [&str; 2] = ["scheduled", "s"];
    const DEADLINED_TAGS: [&str; 2] = ["deadlined", "d"];
    const PRIORITY_TAGS: [&str; 2] = ["priority", "p"];
    /// Title given to records parsed from blank lines.
    pub const UNTITLED: &str = "(untitled)";

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /* ------------------------ Public entry points ------------------------ */

    /// Parse one `file:line:column:text` search hit into a record.
    pub fn parse_line(raw: &str) -> TodoRecord {
        let raw = raw.trim_end_matches(['\r', '\n']);
        let (location, text) = parse_location(raw);

        let Some(heading) = parse_heading(text) else {
            // Degenerate fallback splits can leave no text at all; keep the raw line then.
            let title = [text, raw]
                .into_iter()
                .find(|t| !t.trim().is_empty())
                .unwrap_or(UNTITLED);
            return TodoRecord::new(location, text, title);
        };

        let tags = classify_tags(heading.tags);
        let mut record = TodoRecord::new(location, text, heading.title);
        record.state = heading.state;
        record.scheduled = tags.scheduled;
        record.deadline = tags.deadline;
        record.priority = tags.priority;
        record.tags = tags.tags;
        record
    }

    /// Split the location prefix off a search hit.
    ///
    /// The file name ends at the first `:<digits>:<digits>:` boundary. Without one, the
    /// line is split positionally on `:` (a leading drive prefix such as `C:` is kept out
    /// of the split). That fallback is a best-effort guess: `file` may come out wrong.
    pub fn parse_location(raw: &str) -> (SourceLocation, &str) {
        split_location(raw).unwrap_or_else(|| fallback_location(raw))
    }

    /// Heading match borrowed from the text it was parsed from.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Heading<'a> {
        pub state: TodoState,
        pub title: &'a str,
        /// Trailing run of `@tag` tokens, leading whitespace included.
        pub tags: &'a str,
    }

    /// Match `#+ (TODO|DONE) <title> [@tag...]`.
    ///
    /// The title is the shortest non-empty prefix after which only `@tag(args)` tokens and
    /// whitespace remain, so `@` inside the title (`mail bob@example.com`) stays in it.
    pub fn parse_heading(text: &str) -> Option<Heading<'_>> {
        let (rest, state) = heading_prefix(text).ok()?;
        if rest.is_empty() {
            return None;
        }

        let tag_run = tag_run_starts(rest);
        let end = rest
            .char_indices()
            .skip(1)
            .map(|(idx, _)| idx)
            .chain(std::iter::once(rest.len()))
            .find(|&idx| tag_run[idx])?;

        Some(Heading {
            state,
            title: &rest[..end],
            tags: &rest[end..],
        })
    }

    /// True when `line` starts like a TODO/DONE heading (`^#+\s+(TODO|DONE)\s`).
    pub fn is_todo_heading(line: &str) -> bool {
        heading_prefix(line).is_ok()
    }

    /// Tag values extracted from a heading's tag run.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct TagData {
        pub scheduled: ScheduleWindow,
        pub deadline: Option<chrono::NaiveDateTime>,
        pub priority: String,
        pub tags: Vec<String>,
    }

    /// Split a tag run on ` @` and sort each token into schedule, deadline, priority or a
    /// plain tag. The first schedule, deadline and priority token wins; later ones are dropped.
    pub fn classify_tags(run: &str) -> TagData {
        let mut data = TagData::default();
        let (mut scheduled, mut deadline, mut priority) = (false, false, false);

        let tokens = run
            .split(" @")
            .map(|t| t.trim())
            .map(|t| t.strip_prefix('@').unwrap_or(t))
            .filter(|t| !t.is_empty());

        for token in tokens {
            match TagKind::of(token) {
                TagKind::Scheduled => {
                    if !scheduled {
                        data.scheduled = tag_payload(token)
                            .map(parse_date_window)
                            .unwrap_or(ScheduleWindow::UNSET);
                        scheduled = true;
                    }
                }
                TagKind::Deadline => {
                    if !deadline {
                        data.deadline = tag_payload(token).and_then(|p| parse_date_window(p).start);
                        deadline = true;
                    }
                }
                TagKind::Priority(label) => {
                    if !priority {
                        data.priority = label.to_string();
                        priority = true;
                    }
                }
                TagKind::Plain => data.tags.push(format!("@{token}")),
            }
        }
        data
    }

    /// Parse a date-window payload: `YYYY-MM-DD[ H[:MM][-H[:MM]]]`.
    ///
    /// Tokens after the time part are ignored. Any unparseable part yields an unset window.
    pub fn parse_date_window(payload: &str) -> ScheduleWindow {
        let mut parts = payload.split_whitespace();
        let Some(date) = parts.next().and_then(|d| all_consuming(parse_date)(d).ok()) else {
            return ScheduleWindow::UNSET;
        };
        let date = date.1;

        let Some(times) = parts.next() else {
            return ScheduleWindow::starting_at(date.and_time(NaiveTime::MIN));
        };
        match all_consuming(time_range)(times) {
            Ok((_, (start, None))) => ScheduleWindow::starting_at(date.and_time(start)),
            Ok((_, (start, Some(end)))) => {
                ScheduleWindow::between(date.and_time(start), date.and_time(end))
            }
            Err(_) => ScheduleWindow::UNSET,
        }
    }

    /* ------------------------------ Location ------------------------------ */

    fn split_location(raw: &str) -> Option<(SourceLocation, &str)> {
        raw.match_indices(':').find_map(|(idx, _)| {
            let (text, (line, column)) = location_numbers(&raw[idx..]).ok()?;
            Some((
                SourceLocation {
                    file: PathBuf::from(&raw[..idx]),
                    line: line.max(1),
                    column: column.max(1),
                },
                text,
            ))
        })
    }

    fn fallback_location(raw: &str) -> (SourceLocation, &str) {
        let (drive, rest) = split_drive(raw);
        let mut parts = rest.splitn(4, ':');
        let file = parts.next().unwrap_or_default();
        let line = parts.next().and_then(parse_position).unwrap_or(1);
        let column = parts.next().and_then(parse_position).unwrap_or(1);
        let text = parts.next().unwrap_or_default();
        (
            SourceLocation {
                file: PathBuf::from(format!("{drive}{file}")),
                line,
                column,
            },
            text,
        )
    }

    fn split_drive(raw: &str) -> (&str, &str) {
        let bytes = raw.as_bytes();
        if bytes.len() > 1 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
            raw.split_at(2)
        } else {
            ("", raw)
        }
    }

    fn parse_position(s: &str) -> Option<u32> {
        s.trim().parse::<u32>().ok().filter(|n| *n >= 1)
    }

    fn location_numbers(i: &str) -> PResult<'_, (u32, u32)> {
        tuple((
            preceded(char(':'), position),
            delimited(char(':'), position, char(':')),
        ))(i)
    }

    fn position(i: &str) -> PResult<'_, u32> {
        map_res(digit1, |s: &str| s.parse::<u32>())(i)
    }

    /* ------------------------------ Headings ------------------------------ */

    fn heading_prefix(i: &str) -> PResult<'_, TodoState> {
        delimited(
            pair(take_while1(|c: char| c == '#'), whitespace1),
            alt((
                map(tag("TODO"), |_: &str| TodoState::Todo),
                map(tag("DONE"), |_: &str| TodoState::Done),
            )),
            whitespace1,
        )(i)
    }

    fn whitespace1(i: &str) -> PResult<'_, &str> {
        take_while1(char::is_whitespace)(i)
    }

    fn is_tag_char(c: char) -> bool {
        c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '#'
    }

    /// For every byte offset of `text`, whether the suffix starting there matches
    /// `(\s+@[\w\-#]+(\(.*\))*)*\s*$`.
    ///
    /// A run of parenthesized groups is any text from `(` to some later `)`, so a tag
    /// followed by `(` matches when any later `)` is itself followed by a matching suffix.
    /// Offsets are filled right to left in one pass; non char boundaries stay `false`.
    fn tag_run_starts(text: &str) -> Vec<bool> {
        let len = text.len();
        let blank_from = text.trim_end().len();
        let mut matches = vec![false; len + 1];
        // closes[p]: some `)` at or after p is followed by a matching suffix.
        let mut closes = vec![false; len + 1];
        matches[len] = true;

        // End of the `[\w\-#]*` run starting right after the current char.
        let mut run_end = len;
        // End of the `@name` head at the first non-whitespace char at or after p.
        let mut pending_head: Option<usize> = None;

        for (p, c) in text.char_indices().rev() {
            let next = p + c.len_utf8();
            if !c.is_whitespace() {
                pending_head = (c == '@' && run_end > next).then_some(run_end);
            }
            matches[p] = if p >= blank_from {
                true
            } else if c.is_whitespace() {
                pending_head.is_some_and(|head| {
                    matches[head] || (text[head..].starts_with('(') && closes[head + 1])
                })
            } else {
                false
            };
            closes[p] = (c == ')' && matches[next]) || closes[next];
            if !is_tag_char(c) {
                run_end = p;
            }
        }
        matches
    }

    /* -------------------------------- Tags -------------------------------- */

    enum TagKind<'a> {
        Scheduled,
        Deadline,
        Priority(&'a str),
        Plain,
    }

    impl<'a> TagKind<'a> {
        fn of(token: &'a str) -> Self {
            if starts_with_call(token, &SCHEDULED_TAGS) {
                return TagKind::Scheduled;
            }
            if starts_with_call(token, &DEADLINED_TAGS) {
                return TagKind::Deadline;
            }
            // Any `p` prefix counts: `@project` is a priority with no label.
            if PRIORITY_TAGS.iter().any(|alias| token.starts_with(alias)) {
                return TagKind::Priority(first_parenthesized(token).unwrap_or_default());
            }
            TagKind::Plain
        }
    }

    fn starts_with_call(token: &str, aliases: &[&str]) -> bool {
        aliases.iter().any(|alias| {
            token
                .strip_prefix(alias)
                .is_some_and(|rest| rest.starts_with('('))
        })
    }

    /// Text between the first `(` and the next `)`.
    fn first_parenthesized(token: &str) -> Option<&str> {
        let open = token.find('(')?;
        let inner = &token[open + 1..];
        let close = inner.find(')')?;
        Some(&inner[..close])
    }

    /// Text between the first `(` and the last `)`.
    fn tag_payload(token: &str) -> Option<&str> {
        let open = token.find('(')?;
        let close = token.rfind(')')?;
        (close > open).then(|| &token[open + 1..close])
    }

    /* ------------------------------ Dates ------------------------------ */

    fn time_range(i: &str) -> PResult<'_, (NaiveTime, Option<NaiveTime>)> {
        pair(parse_time, opt(preceded(char('-'), parse_time)))(i)
    }

    fn parse_date(i: &str) -> PResult<'_, NaiveDate> {
        map_res(
            tuple((
                map_res(take_while_m_n(4, 4, char_is_digit), |s: &str| {
                    s.parse::<i32>()
                }),
                char('-'),
                map_res(take_while_m_n(1, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
                char('-'),
                map_res(take_while_m_n(1, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
            )),
            |(y, _, m, _, d)| NaiveDate::from_ymd_opt(y, m, d).ok_or("invalid date"),
        )(i)
    }

    // Minutes are optional: `9`, `9:30` and `09:30` are all accepted.
    fn parse_time(i: &str) -> PResult<'_, NaiveTime> {
        map_res(
            pair(
                map_res(take_while_m_n(1, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
                opt(preceded(
                    char(':'),
                    map_res(take_while_m_n(1, 2, char_is_digit), |s: &str| {
                        s.parse::<u32>()
                    }),
                )),
            ),
            |(h, m)| NaiveTime::from_hms_opt(h, m.unwrap_or(0), 0).ok_or("invalid time"),
        )(i)
    }

    fn take_while_m_n<F>(m: usize, n: usize, cond: F) -> impl Fn(&str) -> PResult<'_, &str>
    where
        F: Fn(char) -> bool + Copy,
    {
        move |i: &str| {
            let (i, out) = take_while::<_, _, VerboseError<&str>>(cond)(i)?;
            if out.len() < m || out.len() > n {
                Err(nom::Err::Error(VerboseError {
                    errors: vec![(i, VerboseErrorKind::Context("m_n"))],
                }))
            } else {
                Ok((i, out))
            }
        }
    }

    fn char_is_digit(c: char) -> bool {
        c.is_ascii_digit()
    }

}

pub mod log {
    //! Debug output. Off unless `--verbose` or `debug = true` turns it on.

    use chrono::Local;
    use std::fmt::Display;

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct DebugLog {
        enabled: bool,
    }

    impl DebugLog {
        pub fn new(enabled: bool) -> Self {
            Self { enabled }
        }

        pub fn is_enabled(&self) -> bool {
            self.enabled
        }

        /// Write `HH:MM:SS.mmm text` to stderr.
        pub fn debug(&self, text: impl Display) {
            if self.enabled {
                eprintln!("{} {}", Local::now().format("%H:%M:%S%.3f"), text);
            }
        }
    }
}

pub mod search {
    //! Line-search collaborator.
    //!
    //! A `LineSearch` finds TODO/DONE headings under one root folder and returns raw
    //! `file:line:column:text` lines. `refresh` fans out one search per root and only
    //! hands back records when every search succeeded.

    use crate::core::TodoRecord;
    use crate::log::DebugLog;
    use crate::parser::{is_todo_heading, parse_line};
    use indexmap::{IndexMap, IndexSet};
    use std::{
        fs, io,
        path::{Path, PathBuf},
        process::Command,
        thread,
    };

    /// Regex handed to ripgrep. Matches what `parser::is_todo_heading` accepts.
    pub const TODO_HEADING_PATTERN: &str = r"^#+\s+(TODO|DONE)\s";

    #[derive(Debug, thiserror::Error)]
    pub enum SearchError {
        #[error("search root {0:?} does not exist")]
        MissingRoot(PathBuf),
        #[error("failed to start {program:?}")]
        Spawn {
            program: PathBuf,
            #[source]
            source: io::Error,
        },
        #[error("search in {root:?} failed ({status}): {stderr}")]
        Failed {
            root: PathBuf,
            status: String,
            stderr: String,
        },
        #[error("reading {path:?}")]
        Io {
            path: PathBuf,
            #[source]
            source: io::Error,
        },
        #[error("search worker for {0:?} panicked")]
        Panicked(PathBuf),
    }

    /// Finds heading lines below `root`.
    pub trait LineSearch: Sync {
        fn search(&self, root: &Path) -> Result<Vec<String>, SearchError>;
    }

    /* ------------------------------ ripgrep ------------------------------ */

    /// Spawns `rg` once per root.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct RipgrepSearch {
        pub program: PathBuf,
        pub max_columns: usize,
    }

    impl Default for RipgrepSearch {
        fn default() -> Self {
            Self {
                program: PathBuf::from("rg"),
                max_columns: 1000,
            }
        }
    }

    impl RipgrepSearch {
        pub fn new(program: impl Into<PathBuf>) -> Self {
            Self {
                program: program.into(),
                ..Self::default()
            }
        }
    }

    impl LineSearch for RipgrepSearch {
        fn search(&self, root: &Path) -> Result<Vec<String>, SearchError> {
            let output = Command::new(&self.program)
                .args([
                    "--no-messages",
                    "--vimgrep",
                    "-H",
                    "--column",
                    "--line-number",
                    "--color",
                    "never",
                    "--no-config",
                ])
                .arg(format!("--max-columns={}", self.max_columns))
                .arg("-e")
                .arg(TODO_HEADING_PATTERN)
                .arg(root)
                .output()
                .map_err(|source| SearchError::Spawn {
                    program: self.program.clone(),
                    source,
                })?;

            // rg: 0 = matches, 1 = no matches, anything else = error.
            match output.status.code() {
                Some(0) => Ok(split_lines(&String::from_utf8_lossy(&output.stdout))),
                Some(1) => Ok(Vec::new()),
                _ => Err(SearchError::Failed {
                    root: root.to_path_buf(),
                    status: output.status.to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                }),
            }
        }
    }

    fn split_lines(stdout: &str) -> Vec<String> {
        stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect()
    }

    /* ------------------------------ built-in ------------------------------ */

    /// In-process walk producing the same `path:line:column:text` shape as ripgrep.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct WalkSearch {
        pub extensions: Vec<String>,
    }

    impl Default for WalkSearch {
        fn default() -> Self {
            Self {
                extensions: vec!["md".to_string(), "markdown".to_string()],
            }
        }
    }

    impl WalkSearch {
        fn wants(&self, path: &Path) -> bool {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
                .unwrap_or(false)
        }

        fn visit(&self, path: &Path, out: &mut Vec<PathBuf>) -> Result<(), SearchError> {
            let io_err = |source| SearchError::Io {
                path: path.to_path_buf(),
                source,
            };
            let metadata = fs::metadata(path).map_err(io_err)?;
            if metadata.is_dir() {
                for entry in fs::read_dir(path).map_err(io_err)? {
                    let entry = entry.map_err(io_err)?;
                    if entry.file_type().map_err(io_err)?.is_symlink() {
                        continue;
                    }
                    self.visit(&entry.path(), out)?;
                }
            } else if metadata.is_file() && self.wants(path) {
                out.push(path.to_path_buf());
            }
            Ok(())
        }
    }

    impl LineSearch for WalkSearch {
        fn search(&self, root: &Path) -> Result<Vec<String>, SearchError> {
            let mut files = Vec::new();
            self.visit(root, &mut files)?;
            files.sort();

            let mut out = Vec::new();
            for file in files {
                let bytes = fs::read(&file).map_err(|source| SearchError::Io {
                    path: file.clone(),
                    source,
                })?;
                let text = String::from_utf8_lossy(&bytes);
                for (idx, line) in text.lines().enumerate() {
                    if is_todo_heading(line) {
                        out.push(format!("{}:{}:1:{}", file.display(), idx + 1, line));
                    }
                }
            }
            Ok(out)
        }
    }

    /* ------------------------------ refresh ------------------------------ */

    /// Search every root concurrently and parse all hits.
    ///
    /// Results are aggregated only after every search finished; the first failure in root
    /// order fails the whole refresh. Records come back in root order, then hit order.
    pub fn refresh(
        search: &dyn LineSearch,
        roots: &[PathBuf],
        log: &DebugLog,
    ) -> Result<Vec<TodoRecord>, SearchError> {
        log.debug("Refresh Todo List");
        let roots: IndexSet<PathBuf> = roots.iter().filter_map(|r| local_root(r, log)).collect();

        let outcomes: Vec<(PathBuf, Result<Vec<String>, SearchError>)> = thread::scope(|scope| {
            let handles: Vec<_> = roots
                .iter()
                .map(|root| (root, scope.spawn(move || search_root(search, root, log))))
                .collect();
            handles
                .into_iter()
                .map(|(root, handle)| {
                    let result = handle
                        .join()
                        .unwrap_or_else(|_| Err(SearchError::Panicked(root.clone())));
                    (root.clone(), result)
                })
                .collect()
        });

        let mut hits: IndexMap<PathBuf, Vec<String>> = IndexMap::new();
        for (root, result) in outcomes {
            hits.insert(root, result?);
        }

        let records: Vec<TodoRecord> = hits
            .values()
            .flatten()
            .map(|line| parse_line(line))
            .collect();
        for record in &records {
            log.debug(format!("found : {record}"));
        }
        Ok(records)
    }

    fn search_root(
        search: &dyn LineSearch,
        root: &Path,
        log: &DebugLog,
    ) -> Result<Vec<String>, SearchError> {
        if !root.exists() {
            return Err(SearchError::MissingRoot(root.to_path_buf()));
        }
        log.debug(format!("search : {}", root.display()));
        let lines = search.search(root)?;
        log.debug(format!("search result: {} line(s) from {}", lines.len(), root.display()));
        Ok(lines)
    }

    /// Roots on local disk only: `file://` is stripped, other `scheme://` roots are skipped.
    fn local_root(root: &Path, log: &DebugLog) -> Option<PathBuf> {
        let text = root.to_string_lossy();
        if let Some(path) = text.strip_prefix("file://") {
            return Some(PathBuf::from(path));
        }
        if text.contains("://") {
            log.debug(format!("skipping non-local root {text}"));
            return None;
        }
        Some(root.to_path_buf())
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::TodoState;
        use std::fs;

        struct Canned {
            fail_on: Option<String>,
        }

        impl LineSearch for Canned {
            fn search(&self, root: &Path) -> Result<Vec<String>, SearchError> {
                let name = root.file_name().unwrap().to_string_lossy().to_string();
                if self.fail_on.as_deref() == Some(name.as_str()) {
                    return Err(SearchError::Failed {
                        root: root.to_path_buf(),
                        status: "exit status: 2".to_string(),
                        stderr: "boom".to_string(),
                    });
                }
                Ok(vec![
                    format!("{}/a.md:1:1:# TODO first in {name}", root.display()),
                    format!("{}/a.md:2:1:# DONE second in {name}", root.display()),
                ])
            }
        }

        #[test]
        fn walk_search_emits_search_tool_lines() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let notes = tmp.path().join("notes");
            fs::create_dir_all(&notes).expect("mkdir notes");
            let a = notes.join("a.md");
            fs::write(&a, "# Title\n# TODO Buy milk @s(2024-03-01)\ntext\n## DONE Old\n")
                .expect("write a");
            fs::write(tmp.path().join("b.markdown"), "# TODO Other\n").expect("write b");
            fs::write(tmp.path().join("c.txt"), "# TODO Ignored\n").expect("write c");

            let lines = WalkSearch::default().search(tmp.path()).expect("search");
            assert_eq!(lines.len(), 3);
            assert!(lines.contains(&format!("{}:2:1:# TODO Buy milk @s(2024-03-01)", a.display())));
            assert!(lines.contains(&format!("{}:4:1:## DONE Old", a.display())));
            assert!(!lines.iter().any(|l| l.contains("Ignored")));
        }

        #[test]
        fn refresh_parses_walked_files() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let file = tmp.path().join("todo.md");
            fs::write(&file, "# TODO Call mom @p(A) @family\n").expect("write");

            let records = refresh(&WalkSearch::default(), &[tmp.path().to_path_buf()], &DebugLog::default())
                .expect("refresh");
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].location.file, file);
            assert_eq!(records[0].location.line, 1);
            assert_eq!(records[0].title, "Call mom");
            assert_eq!(records[0].priority, "A");
            assert_eq!(records[0].tags, vec!["@family"]);
        }

        #[test]
        fn refresh_keeps_root_order() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let one = tmp.path().join("one");
            let two = tmp.path().join("two");
            fs::create_dir_all(&one).expect("mkdir one");
            fs::create_dir_all(&two).expect("mkdir two");

            let records = refresh(
                &Canned { fail_on: None },
                &[two.clone(), one.clone(), two.clone()],
                &DebugLog::default(),
            )
            .expect("refresh");
            let titles: Vec<&str> = records.iter().map(|r| r.title.as_str()).collect();
            assert_eq!(
                titles,
                vec!["first in two", "second in two", "first in one", "second in one"]
            );
            assert_eq!(records[1].state, TodoState::Done);
        }

        #[test]
        fn one_failed_root_fails_the_refresh() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let one = tmp.path().join("one");
            let two = tmp.path().join("two");
            fs::create_dir_all(&one).expect("mkdir one");
            fs::create_dir_all(&two).expect("mkdir two");

            let err = refresh(
                &Canned {
                    fail_on: Some("two".to_string()),
                },
                &[one, two],
                &DebugLog::default(),
            )
            .expect_err("refresh should fail");
            assert!(matches!(err, SearchError::Failed { .. }));
        }

        #[test]
        fn missing_root_is_an_error() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let missing = tmp.path().join("nope");
            let err = refresh(&Canned { fail_on: None }, &[missing.clone()], &DebugLog::default())
                .expect_err("missing root");
            match err {
                SearchError::MissingRoot(path) => assert_eq!(path, missing),
                other => panic!("unexpected error {other:?}"),
            }
        }

        #[test]
        fn non_local_roots_are_skipped() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let local = tmp.path().join("local");
            fs::create_dir_all(&local).expect("mkdir local");
            let uri = PathBuf::from(format!("file://{}", local.display()));

            let records = refresh(
                &Canned { fail_on: None },
                &[PathBuf::from("vscode-remote://host/notes"), uri],
                &DebugLog::default(),
            )
            .expect("refresh");
            assert_eq!(records.len(), 2);
            assert_eq!(records[0].title, "first in local");
        }
    }
}

pub mod agenda {
    //! Agenda range engine: which slice of the calendar is on screen, how to page
    //! through it, and how records are laid out day by day.

    use crate::core::TodoRecord;
    use chrono::{Datelike, Duration, Months, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
    use serde::{Deserialize, Serialize};
    use std::{collections::BTreeMap, fmt, str::FromStr};

    /* ------------------------------ Range types ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum RangeType {
        #[default]
        Week,
        Fortnight,
        Month,
        Year,
    }

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    #[error("unknown range type {0:?} (expected week, fortnight, month or year)")]
    pub struct ParseRangeError(pub String);

    impl FromStr for RangeType {
        type Err = ParseRangeError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            match s.trim().to_ascii_lowercase().as_str() {
                "week" | "w" => Ok(RangeType::Week),
                "fortnight" | "f" => Ok(RangeType::Fortnight),
                "month" | "m" => Ok(RangeType::Month),
                "year" | "y" => Ok(RangeType::Year),
                _ => Err(ParseRangeError(s.to_string())),
            }
        }
    }

    impl fmt::Display for RangeType {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.name())
        }
    }

    /// Paging direction (`+1` / `-1`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Direction {
        Forward,
        Backward,
    }

    impl RangeType {
        pub const ALL: [RangeType; 4] = [
            RangeType::Week,
            RangeType::Fortnight,
            RangeType::Month,
            RangeType::Year,
        ];

        pub fn name(self) -> &'static str {
            match self {
                RangeType::Week => "week",
                RangeType::Fortnight => "fortnight",
                RangeType::Month => "month",
                RangeType::Year => "year",
            }
        }

        /// Canonical first day of the period containing `today`.
        pub fn anchor(self, today: NaiveDate, week_start: Weekday) -> NaiveDate {
            match self {
                RangeType::Week | RangeType::Fortnight => start_of_week(today, week_start),
                RangeType::Month => first_day_of_month(today),
                RangeType::Year => first_day_of_year(today),
            }
        }

        /// `start` moved one page. Month and year steps clamp at month end.
        pub fn step(self, start: NaiveDate, direction: Direction) -> NaiveDate {
            let shifted = match (self, direction) {
                (RangeType::Week, Direction::Forward) => start.checked_add_signed(Duration::days(7)),
                (RangeType::Week, Direction::Backward) => start.checked_sub_signed(Duration::days(7)),
                (RangeType::Fortnight, Direction::Forward) => {
                    start.checked_add_signed(Duration::days(14))
                }
                (RangeType::Fortnight, Direction::Backward) => {
                    start.checked_sub_signed(Duration::days(14))
                }
                (RangeType::Month, Direction::Forward) => start.checked_add_months(Months::new(1)),
                (RangeType::Month, Direction::Backward) => start.checked_sub_months(Months::new(1)),
                (RangeType::Year, Direction::Forward) => start.checked_add_months(Months::new(12)),
                (RangeType::Year, Direction::Backward) => start.checked_sub_months(Months::new(12)),
            };
            shifted.unwrap_or(start)
        }

        /// Days on a page starting at `start`.
        pub fn window_length(self, start: NaiveDate) -> i64 {
            match self {
                RangeType::Week => 7,
                RangeType::Fortnight => 14,
                RangeType::Month | RangeType::Year => {
                    (self.step(start, Direction::Forward) - start).num_days()
                }
            }
        }
    }

    fn start_of_week(day: NaiveDate, week_start: Weekday) -> NaiveDate {
        let back = (day.weekday().num_days_from_monday() + 7 - week_start.num_days_from_monday()) % 7;
        day - Duration::days(i64::from(back))
    }

    fn first_day_of_month(day: NaiveDate) -> NaiveDate {
        NaiveDate::from_ymd_opt(day.year(), day.month(), 1).unwrap_or(day)
    }

    fn first_day_of_year(day: NaiveDate) -> NaiveDate {
        NaiveDate::from_ymd_opt(day.year(), 1, 1).unwrap_or(day)
    }

    /* ------------------------------ State ------------------------------ */

    /// Two-keystroke range selection: prefix, then the range choice.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub enum RangeSelector {
        #[default]
        Idle,
        AwaitingRangeChoice,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Change {
        Changed,
        Unchanged,
    }

    /// Browsing position of one open agenda view.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct AgendaState {
        range: RangeType,
        start: NaiveDate,
        week_start: Weekday,
        selector: RangeSelector,
    }

    impl AgendaState {
        pub fn new(range: RangeType, week_start: Weekday, today: NaiveDate) -> Self {
            Self {
                range,
                start: range.anchor(today, week_start),
                week_start,
                selector: RangeSelector::Idle,
            }
        }

        pub fn range(&self) -> RangeType {
            self.range
        }

        pub fn start(&self) -> NaiveDate {
            self.start
        }

        pub fn start_datetime(&self) -> NaiveDateTime {
            self.start.and_time(NaiveTime::MIN)
        }

        /// First day after the page (exclusive bound).
        pub fn end(&self) -> NaiveDate {
            self.start + Duration::days(self.window_length())
        }

        pub fn week_start(&self) -> Weekday {
            self.week_start
        }

        pub fn selector(&self) -> RangeSelector {
            self.selector
        }

        /// Switch to `range`, anchored on the period containing `today`.
        pub fn set_range(&mut self, range: RangeType, today: NaiveDate) -> Change {
            let start = range.anchor(today, self.week_start);
            if range == self.range && start == self.start {
                return Change::Unchanged;
            }
            self.range = range;
            self.start = start;
            Change::Changed
        }

        /// Re-anchor the current range on `today`. `Unchanged` when today is already on the page's anchor.
        pub fn goto_today(&mut self, today: NaiveDate) -> Change {
            self.set_range(self.range, today)
        }

        pub fn paginate(&mut self, direction: Direction) -> Change {
            self.start = self.range.step(self.start, direction);
            Change::Changed
        }

        pub fn begin_range_selection(&mut self) {
            self.selector = RangeSelector::AwaitingRangeChoice;
        }

        /// Consume the selector, leaving it `Idle`.
        pub fn take_selector(&mut self) -> RangeSelector {
            std::mem::take(&mut self.selector)
        }

        pub fn window_length(&self) -> i64 {
            self.range.window_length(self.start)
        }

        /// Is `at` within `[start, end)`?
        pub fn contains(&self, at: NaiveDateTime) -> bool {
            at >= self.start_datetime() && at < self.end().and_time(NaiveTime::MIN)
        }

        pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
            self.start.iter_days().take(self.window_length().max(0) as usize)
        }

        /// Lay out one page: a header per day followed by that day's scheduled records,
        /// in input order.
        pub fn render_page(&self, records: &[TodoRecord]) -> RenderedPage {
            let mut buckets: BTreeMap<NaiveDate, Vec<usize>> = BTreeMap::new();
            for (idx, record) in records.iter().enumerate() {
                if let Some(start) = record.scheduled.start {
                    if self.contains(start) {
                        buckets.entry(start.date()).or_default().push(idx);
                    }
                }
            }

            let mut page = RenderedPage::default();
            for day in self.days() {
                page.headers.insert(day, page.lines.len());
                page.lines.push(day_header(day));
                for &idx in buckets.get(&day).into_iter().flatten() {
                    page.display.insert(page.lines.len(), idx);
                    page.lines.push(item_line(&records[idx]));
                }
            }
            page
        }
    }

    /* ------------------------------ Rendering ------------------------------ */

    /// One rendered page plus the line → record mapping built with it.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct RenderedPage {
        pub lines: Vec<String>,
        display: BTreeMap<usize, usize>,
        headers: BTreeMap<NaiveDate, usize>,
    }

    impl RenderedPage {
        pub fn text(&self) -> String {
            self.lines.join("\n")
        }

        /// Index (into the rendered record slice) of the record shown on `line`.
        pub fn record_at(&self, line: usize) -> Option<usize> {
            self.display.get(&line).copied()
        }

        /// Line a record was rendered on, if it is on this page.
        pub fn display_line(&self, record: usize) -> Option<usize> {
            self.display
                .iter()
                .find(|(_, idx)| **idx == record)
                .map(|(line, _)| *line)
        }

        /// Line of the header for `day`.
        pub fn line_of(&self, day: NaiveDate) -> Option<usize> {
            self.headers.get(&day).copied()
        }

        pub fn day_count(&self) -> usize {
            self.headers.len()
        }

        /// `(line, record index)` pairs in line order.
        pub fn entries(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
            self.display.iter().map(|(line, idx)| (*line, *idx))
        }
    }

    fn day_header(day: NaiveDate) -> String {
        day.format("%Y/%m/%d (%a)").to_string()
    }

    fn item_line(record: &TodoRecord) -> String {
        let mut line = format!("   {}", record.title);
        if record.has_priority() {
            line.push_str(" #");
            line.push_str(&record.priority);
        }
        if !record.tags.is_empty() {
            line.push(' ');
            line.push_str(&record.tags.join(","));
        }
        line
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::{ScheduleWindow, SourceLocation};
        use std::path::PathBuf;

        fn day(y: i32, m: u32, d: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, d).unwrap()
        }

        fn record(title: &str, start: Option<NaiveDateTime>) -> TodoRecord {
            let location = SourceLocation {
                file: PathBuf::from("a.md"),
                line: 1,
                column: 1,
            };
            let mut r = TodoRecord::new(location, format!("# TODO {title}"), title);
            if let Some(start) = start {
                r.scheduled = ScheduleWindow::starting_at(start);
            }
            r
        }

        fn headers(page: &RenderedPage) -> usize {
            page.lines.iter().filter(|l| !l.starts_with("   ")).count()
        }

        #[test]
        fn anchors_follow_range_type() {
            let wed = day(2024, 3, 6);
            assert_eq!(RangeType::Week.anchor(wed, Weekday::Sun), day(2024, 3, 3));
            assert_eq!(RangeType::Week.anchor(wed, Weekday::Mon), day(2024, 3, 4));
            assert_eq!(RangeType::Fortnight.anchor(wed, Weekday::Wed), wed);
            assert_eq!(RangeType::Month.anchor(wed, Weekday::Sun), day(2024, 3, 1));
            assert_eq!(RangeType::Year.anchor(wed, Weekday::Sun), day(2024, 1, 1));
        }

        #[test]
        fn set_range_reports_changes() {
            let today = day(2024, 3, 6);
            let mut state = AgendaState::new(RangeType::Week, Weekday::Sun, today);
            assert_eq!(state.set_range(RangeType::Week, today), Change::Unchanged);
            assert_eq!(state.set_range(RangeType::Month, today), Change::Changed);
            assert_eq!(state.start(), day(2024, 3, 1));
            assert_eq!(state.set_range(RangeType::Month, day(2024, 3, 30)), Change::Unchanged);
            assert_eq!(state.set_range(RangeType::Month, day(2024, 4, 2)), Change::Changed);
        }

        #[test]
        fn goto_today_after_paging() {
            let today = day(2024, 3, 6);
            let mut state = AgendaState::new(RangeType::Week, Weekday::Sun, today);
            state.paginate(Direction::Forward);
            assert_eq!(state.goto_today(today), Change::Changed);
            assert_eq!(state.start(), day(2024, 3, 3));
            assert_eq!(state.goto_today(today), Change::Unchanged);
        }

        #[test]
        fn window_lengths() {
            assert_eq!(RangeType::Week.window_length(day(2024, 3, 3)), 7);
            assert_eq!(RangeType::Fortnight.window_length(day(2024, 3, 3)), 14);
            assert_eq!(RangeType::Month.window_length(day(2024, 2, 1)), 29);
            assert_eq!(RangeType::Month.window_length(day(2023, 2, 1)), 28);
            assert_eq!(RangeType::Month.window_length(day(2024, 1, 1)), 31);
            assert_eq!(RangeType::Year.window_length(day(2024, 1, 1)), 366);
            assert_eq!(RangeType::Year.window_length(day(2023, 1, 1)), 365);
        }

        #[test]
        fn pagination_is_its_own_inverse() {
            for today in [day(2024, 2, 29), day(2023, 12, 31), day(2024, 3, 6)] {
                for range in RangeType::ALL {
                    let mut state = AgendaState::new(range, Weekday::Sun, today);
                    let before = state.start();
                    assert_eq!(state.paginate(Direction::Forward), Change::Changed);
                    assert_ne!(state.start(), before);
                    state.paginate(Direction::Backward);
                    assert_eq!(state.start(), before, "{range} from {today}");
                }
            }
        }

        #[test]
        fn pagination_steps() {
            let mut state = AgendaState::new(RangeType::Month, Weekday::Sun, day(2024, 12, 15));
            state.paginate(Direction::Forward);
            assert_eq!(state.start(), day(2025, 1, 1));
            let mut state = AgendaState::new(RangeType::Year, Weekday::Sun, day(2024, 12, 15));
            state.paginate(Direction::Backward);
            assert_eq!(state.start(), day(2023, 1, 1));
            let mut state = AgendaState::new(RangeType::Fortnight, Weekday::Sun, day(2024, 3, 6));
            state.paginate(Direction::Forward);
            assert_eq!(state.start(), day(2024, 3, 17));
        }

        #[test]
        fn day_header_counts() {
            let week = AgendaState::new(RangeType::Week, Weekday::Sun, day(2024, 3, 6));
            let page = week.render_page(&[]);
            assert_eq!(headers(&page), 7);
            assert_eq!(page.lines[0], "2024/03/03 (Sun)");
            assert_eq!(page.lines[6], "2024/03/09 (Sat)");

            let feb = AgendaState::new(RangeType::Month, Weekday::Sun, day(2024, 2, 10));
            assert_eq!(headers(&feb.render_page(&[])), 29);
            let feb = AgendaState::new(RangeType::Month, Weekday::Sun, day(2023, 2, 10));
            assert_eq!(headers(&feb.render_page(&[])), 28);
            let year = AgendaState::new(RangeType::Year, Weekday::Sun, day(2024, 7, 1));
            assert_eq!(year.render_page(&[]).day_count(), 366);
        }

        #[test]
        fn midnight_belongs_to_the_new_day() {
            let state = AgendaState::new(RangeType::Week, Weekday::Sun, day(2024, 3, 6));
            let records = vec![
                record("late", day(2024, 3, 4).and_hms_opt(23, 59, 0)),
                record("midnight", day(2024, 3, 5).and_hms_opt(0, 0, 0)),
            ];
            let page = state.render_page(&records);
            let mar4 = page.line_of(day(2024, 3, 4)).expect("mar 4");
            let mar5 = page.line_of(day(2024, 3, 5)).expect("mar 5");
            assert_eq!(page.record_at(mar4 + 1), Some(0));
            assert_eq!(page.record_at(mar5 + 1), Some(1));
            assert_eq!(page.display_line(1), Some(mar5 + 1));
        }

        #[test]
        fn same_start_keeps_input_order() {
            let state = AgendaState::new(RangeType::Week, Weekday::Sun, day(2024, 3, 6));
            let at = day(2024, 3, 6).and_hms_opt(9, 0, 0);
            let records = vec![record("b", at), record("a", at), record("c", at)];
            let page = state.render_page(&records);
            let line = page.line_of(day(2024, 3, 6)).expect("header");
            assert_eq!(page.lines[line + 1], "   b");
            assert_eq!(page.lines[line + 2], "   a");
            assert_eq!(page.lines[line + 3], "   c");
            let order: Vec<usize> = page.entries().map(|(_, idx)| idx).collect();
            assert_eq!(order, vec![0, 1, 2]);
        }

        #[test]
        fn unscheduled_and_out_of_range_records_are_hidden() {
            let state = AgendaState::new(RangeType::Week, Weekday::Sun, day(2024, 3, 6));
            let mut deadline_only = record("deadline", None);
            deadline_only.deadline = day(2024, 3, 6).and_hms_opt(0, 0, 0);
            let records = vec![
                record("unscheduled", None),
                deadline_only,
                record("next week", day(2024, 3, 10).and_hms_opt(0, 0, 0)),
                record("last week", day(2024, 3, 2).and_hms_opt(12, 0, 0)),
            ];
            let page = state.render_page(&records);
            assert_eq!(page.lines.len(), 7);
            assert_eq!(page.entries().count(), 0);
        }

        #[test]
        fn item_lines_show_priority_and_tags() {
            let state = AgendaState::new(RangeType::Week, Weekday::Sun, day(2024, 3, 6));
            let mut r = record("Review", day(2024, 3, 3).and_hms_opt(10, 0, 0));
            r.priority = "A".to_string();
            r.tags = vec!["@work".to_string(), "@home".to_string()];
            let plain = record("Plain", day(2024, 3, 3).and_hms_opt(11, 0, 0));
            let page = state.render_page(&[r, plain]);
            assert_eq!(page.lines[1], "   Review #A @work,@home");
            assert_eq!(page.lines[2], "   Plain");
            assert_eq!(page.lines[3], "2024/03/04 (Mon)");
        }
    }
}

pub mod view {
    //! Views the editor host can open, and the command vocabulary they answer to.

    use crate::agenda::{AgendaState, Change, Direction, RangeSelector, RangeType, RenderedPage};
    use crate::core::TodoRecord;
    use crate::log::DebugLog;
    use crate::search::{LineSearch, SearchError, refresh};
    use chrono::{Local, NaiveDate};
    use std::{fmt, path::PathBuf};

    /* ------------------------------ Commands ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum Command {
        NextPage,
        PreviousPage,
        GotoToday,
        SelectRangePrefix,
        SelectRange(RangeType),
        RefreshTodoList,
    }

    impl Command {
        /// Parse a command token. Tokens outside the vocabulary give `None`.
        pub fn from_token(token: &str) -> Option<Self> {
            let command = match token.trim() {
                "nextPage" => Command::NextPage,
                "previousPage" => Command::PreviousPage,
                "gotoToday" => Command::GotoToday,
                "selectRangePrefix" => Command::SelectRangePrefix,
                "selectRangeWeek" => Command::SelectRange(RangeType::Week),
                "selectRangeFortnight" => Command::SelectRange(RangeType::Fortnight),
                "selectRangeMonth" => Command::SelectRange(RangeType::Month),
                "selectRangeYear" => Command::SelectRange(RangeType::Year),
                "refreshTodoList" => Command::RefreshTodoList,
                _ => return None,
            };
            Some(command)
        }

        pub fn token(self) -> &'static str {
            match self {
                Command::NextPage => "nextPage",
                Command::PreviousPage => "previousPage",
                Command::GotoToday => "gotoToday",
                Command::SelectRangePrefix => "selectRangePrefix",
                Command::SelectRange(RangeType::Week) => "selectRangeWeek",
                Command::SelectRange(RangeType::Fortnight) => "selectRangeFortnight",
                Command::SelectRange(RangeType::Month) => "selectRangeMonth",
                Command::SelectRange(RangeType::Year) => "selectRangeYear",
                Command::RefreshTodoList => "refreshTodoList",
            }
        }
    }

    impl fmt::Display for Command {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.token())
        }
    }

    /// What the host should do after a command.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Effect {
        /// Nothing to redraw.
        Unchanged,
        /// Re-render; move the cursor to `focus`'s header when given.
        Render { focus: Option<NaiveDate> },
        /// Re-run the search, then re-render.
        Refresh,
    }

    /* ------------------------------ Clock ------------------------------ */

    pub trait Clock {
        fn today(&self) -> NaiveDate;
    }

    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn today(&self) -> NaiveDate {
            Local::now().date_naive()
        }
    }

    #[derive(Debug, Clone, Copy)]
    pub struct FixedClock(pub NaiveDate);

    impl Clock for FixedClock {
        fn today(&self) -> NaiveDate {
            self.0
        }
    }

    /* ------------------------------ Agenda view ------------------------------ */

    #[derive(Debug, Clone)]
    pub struct AgendaView {
        pub state: AgendaState,
        records: Vec<TodoRecord>,
        page: RenderedPage,
    }

    impl AgendaView {
        pub fn new(state: AgendaState) -> Self {
            Self {
                state,
                records: Vec::new(),
                page: RenderedPage::default(),
            }
        }

        pub fn records(&self) -> &[TodoRecord] {
            &self.records
        }

        /// Replace the record list wholesale; the latest refresh wins.
        pub fn replace_records(&mut self, records: Vec<TodoRecord>) {
            self.records = records;
        }

        pub fn render(&mut self) -> &RenderedPage {
            self.page = self.state.render_page(&self.records);
            &self.page
        }

        pub fn page(&self) -> &RenderedPage {
            &self.page
        }

        /// Record under `line` of the last rendered page.
        pub fn record_at_line(&self, line: usize) -> Option<&TodoRecord> {
            self.page.record_at(line).and_then(|idx| self.records.get(idx))
        }

        pub fn handle(&mut self, command: Command, clock: &dyn Clock, log: &DebugLog) -> Effect {
            // Any command ends a pending range selection.
            let selecting = self.state.take_selector() == RangeSelector::AwaitingRangeChoice;
            match command {
                Command::SelectRangePrefix => {
                    self.state.begin_range_selection();
                    Effect::Unchanged
                }
                Command::SelectRange(range) if selecting => {
                    match self.state.set_range(range, clock.today()) {
                        Change::Changed => Effect::Render { focus: None },
                        Change::Unchanged => Effect::Unchanged,
                    }
                }
                Command::SelectRange(range) => {
                    log.debug(format!("ignoring {range} selection without prefix"));
                    Effect::Unchanged
                }
                Command::NextPage => {
                    self.state.paginate(Direction::Forward);
                    Effect::Render { focus: None }
                }
                Command::PreviousPage => {
                    self.state.paginate(Direction::Backward);
                    Effect::Render { focus: None }
                }
                Command::GotoToday => {
                    let today = clock.today();
                    if self.state.goto_today(today) == Change::Unchanged {
                        log.debug("already showing the period containing today");
                    }
                    Effect::Render { focus: Some(today) }
                }
                Command::RefreshTodoList => Effect::Refresh,
            }
        }
    }

    /* ------------------------------ View kinds ------------------------------ */

    #[derive(Debug, Clone)]
    pub enum ViewKind {
        Agenda(AgendaView),
    }

    impl ViewKind {
        pub fn handle(&mut self, command: Command, clock: &dyn Clock, log: &DebugLog) -> Effect {
            match self {
                ViewKind::Agenda(view) => view.handle(command, clock, log),
            }
        }

        /// Unknown tokens are inert: no state change, no render.
        pub fn handle_token(&mut self, token: &str, clock: &dyn Clock, log: &DebugLog) -> Effect {
            match Command::from_token(token) {
                Some(command) => self.handle(command, clock, log),
                None => {
                    log.debug(format!("unknown command {token:?}"));
                    Effect::Unchanged
                }
            }
        }

        /// One-line caption for the current position.
        pub fn heading(&self) -> String {
            match self {
                ViewKind::Agenda(view) => format!(
                    "Agenda ({}) {} .. {}",
                    view.state.range(),
                    view.state.start(),
                    view.state.end().pred_opt().unwrap_or(view.state.start())
                ),
            }
        }

        pub fn render(&mut self) -> &RenderedPage {
            match self {
                ViewKind::Agenda(view) => view.render(),
            }
        }

        pub fn record_at_line(&self, line: usize) -> Option<&TodoRecord> {
            match self {
                ViewKind::Agenda(view) => view.record_at_line(line),
            }
        }

        /// Run the search and swap in the new records. On failure the old records stay.
        pub fn refresh(
            &mut self,
            search: &dyn LineSearch,
            roots: &[PathBuf],
            log: &DebugLog,
        ) -> Result<usize, SearchError> {
            let records = refresh(search, roots, log)?;
            let count = records.len();
            match self {
                ViewKind::Agenda(view) => view.replace_records(records),
            }
            Ok(count)
        }
    }

}

pub mod config {
    //! Settings: TOML file first, CLI flags on top. Every field has a default.

    use crate::agenda::RangeType;
    use crate::search::{LineSearch, RipgrepSearch, WalkSearch};
    use anyhow::{Context, Result};
    use chrono::Weekday;
    use serde::{Deserialize, Serialize};
    use std::{fmt, fs, path::Path, path::PathBuf, str::FromStr};

    /// Which line search feeds the agenda.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Backend {
        #[default]
        Ripgrep,
        Builtin,
    }

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    #[error("unknown search backend {0:?} (expected ripgrep or builtin)")]
    pub struct ParseBackendError(pub String);

    impl FromStr for Backend {
        type Err = ParseBackendError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            match s.trim().to_ascii_lowercase().as_str() {
                "ripgrep" | "rg" => Ok(Backend::Ripgrep),
                "builtin" => Ok(Backend::Builtin),
                _ => Err(ParseBackendError(s.to_string())),
            }
        }
    }

    impl fmt::Display for Backend {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Backend::Ripgrep => f.write_str("ripgrep"),
                Backend::Builtin => f.write_str("builtin"),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct AgendaConfig {
        /// Folders searched for TODO headings.
        pub roots: Vec<PathBuf>,
        pub week_start: Weekday,
        pub default_range: RangeType,
        pub debug: bool,
        pub backend: Backend,
        pub ripgrep_path: PathBuf,
    }

    impl Default for AgendaConfig {
        fn default() -> Self {
            Self {
                roots: Vec::new(),
                week_start: Weekday::Sun,
                default_range: RangeType::Week,
                debug: false,
                backend: Backend::Ripgrep,
                ripgrep_path: PathBuf::from("rg"),
            }
        }
    }

    impl AgendaConfig {
        pub fn from_toml_str(text: &str) -> Result<Self> {
            toml::from_str(text).context("parsing agenda config")
        }

        pub fn load(path: &Path) -> Result<Self> {
            let text = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
            Self::from_toml_str(&text).with_context(|| format!("loading {:?}", path))
        }

        pub fn line_search(&self) -> Box<dyn LineSearch> {
            match self.backend {
                Backend::Ripgrep => Box::new(RipgrepSearch::new(self.ripgrep_path.clone())),
                Backend::Builtin => Box::new(WalkSearch::default()),
            }
        }
    }

}

pub use agenda::{AgendaState, RangeType, RenderedPage};
pub use parser::parse_line;
pub use view::{Command, Effect, ViewKind};
