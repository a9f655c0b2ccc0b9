//! yt-dlp invocation and output parsing.

use std::env;
use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::LazyLock;
use std::sync::mpsc;
use std::thread;

use anyhow::{Context, Result, anyhow, bail};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

/// Prefers H.264/AAC at the highest resolution before allowing other codecs;
/// YouTube often labels low bitrate AV1 streams as "best".
pub const FORMAT_SELECTOR: &str = concat!(
    "bestvideo[height>=2160][vcodec^=avc1]+bestaudio[acodec^=mp4a]/",
    "bestvideo[height>=1440][vcodec^=avc1]+bestaudio[acodec^=mp4a]/",
    "bestvideo[height>=1080][vcodec^=avc1]+bestaudio[acodec^=mp4a]/",
    "bestvideo[height>=720][vcodec^=avc1]+bestaudio[acodec^=mp4a]/",
    "bestvideo[height>=2160]+bestaudio/",
    "bestvideo[height>=1440]+bestaudio/",
    "bestvideo[height>=1080]+bestaudio/",
    "bestvideo[height>=720]+bestaudio/",
    "95/",
    "best",
);

pub const MAX_PREVIEW_ENTRIES: usize = 200;
pub const DEFAULT_PREVIEW_ENTRIES: usize = 50;

static PROGRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,3}(?:\.\d+)?)%").expect("progress pattern"));
static STREAM_FRAGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.f\d+\.\w+$").expect("fragment pattern"));

const DEBUG_PREFIXES: &[&str] = &["[debug]", "[info]", "[extractor]", "[metadata]", "[youtube]"];

/// External programs used by the pipeline.
#[derive(Debug, Clone)]
pub struct Tools {
    pub yt_dlp: PathBuf,
    /// Needed for playlist merges; yt-dlp degrades to progressive streams
    /// without it.
    pub ffmpeg: Option<PathBuf>,
}

impl Tools {
    /// Looks both programs up on `PATH`.
    pub fn detect() -> Self {
        Self {
            yt_dlp: find_program("yt-dlp").unwrap_or_else(|| PathBuf::from("yt-dlp")),
            ffmpeg: find_program("ffmpeg"),
        }
    }

    pub fn yt_dlp_command(&self, cookies: Option<&Path>) -> Command {
        let mut command = Command::new(&self.yt_dlp);
        if let Some(cookies) = cookies {
            command.arg("--cookies").arg(cookies);
        }
        command
    }
}

pub fn find_program(name: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| {
            fs::metadata(candidate)
                .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
                .unwrap_or(false)
        })
}

/// Result of asking yt-dlp for a human readable title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TitleLookup {
    Found(String),
    Fallback { reason: String },
}

pub fn fetch_title(tools: &Tools, url: &str, cookies: Option<&Path>, playlist: bool) -> TitleLookup {
    let mut command = tools.yt_dlp_command(cookies);
    if playlist {
        command.args(["--skip-download", "--print", "%(playlist_title)s"]);
    } else {
        command.arg("--get-title");
    }
    command.arg(url);

    let output = match run_captured(command) {
        Ok(output) => output,
        Err(err) => {
            return TitleLookup::Fallback {
                reason: format!("{err:#}"),
            };
        }
    };
    let title = output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && *line != "NA")
        .unwrap_or("");
    if title.is_empty() {
        TitleLookup::Fallback {
            reason: "title was empty".to_string(),
        }
    } else {
        TitleLookup::Found(title.to_string())
    }
}

/// Concrete format yt-dlp will pick for [`FORMAT_SELECTOR`]. Unknown values
/// are reported as `"unknown"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFormat {
    pub format_id: String,
    pub resolution: String,
    pub video_codec: String,
    pub audio_codec: String,
    pub filesize: String,
}

impl ResolvedFormat {
    pub fn summary(&self) -> String {
        format!(
            "id={}, resolution={}, video_codec={}, audio_codec={}, filesize={}",
            self.format_id, self.resolution, self.video_codec, self.audio_codec, self.filesize
        )
    }

    /// Display lines for the job card; unknown values are omitted.
    pub fn metadata_lines(&self) -> Vec<String> {
        let mut lines = vec![format!("Format ID: {}", self.format_id)];
        for (label, value) in [
            ("Resolution", &self.resolution),
            ("Video Codec", &self.video_codec),
            ("Audio Codec", &self.audio_codec),
            ("Filesize", &self.filesize),
        ] {
            if !value.is_empty() && value != "unknown" {
                lines.push(format!("{label}: {value}"));
            }
        }
        lines
    }
}

/// Advisory format introspection; never fatal to a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatProbe {
    Resolved(ResolvedFormat),
    Unreported,
    Failed(String),
}

pub fn probe_format(tools: &Tools, url: &str, cookies: Option<&Path>, playlist: bool) -> FormatProbe {
    let mut command = tools.yt_dlp_command(cookies);
    command.args(["-f", FORMAT_SELECTOR, "--skip-download"]);
    if playlist {
        command.arg("--yes-playlist");
    }
    command.args(["--print-json", url]);
    match run_captured(command) {
        Ok(stdout) => match parse_format_probe(&stdout) {
            Some(format) => FormatProbe::Resolved(format),
            None => FormatProbe::Unreported,
        },
        Err(err) => FormatProbe::Failed(format!("{err:#}")),
    }
}

/// Reads the first JSON object printed by `--print-json`.
pub fn parse_format_probe(stdout: &str) -> Option<ResolvedFormat> {
    let info = stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .find_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter(|value| value.as_object().is_some_and(|map| !map.is_empty()))?;

    let requested = info
        .get("requested_formats")
        .and_then(Value::as_array)
        .filter(|formats| !formats.is_empty());

    let Some(requested) = requested else {
        return Some(ResolvedFormat {
            format_id: text_field(&info, "format_id").unwrap_or_else(unknown),
            resolution: resolution(info.get("width"), info.get("height")),
            video_codec: text_field(&info, "vcodec").unwrap_or_else(unknown),
            audio_codec: text_field(&info, "acodec").unwrap_or_else(unknown),
            filesize: format_filesize(
                positive(info.get("filesize")).or_else(|| positive(info.get("filesize_approx"))),
            ),
        });
    };

    let video = requested.iter().find(|entry| has_codec(entry, "vcodec"));
    let audio = requested.iter().find(|entry| has_codec(entry, "acodec"));
    let format_ids: Vec<String> = requested
        .iter()
        .filter_map(|entry| text_field(entry, "format_id"))
        .collect();
    let dimension = |key: &str| {
        video
            .and_then(|entry| entry.get(key).filter(|value| truthy_number(value)))
            .or_else(|| info.get(key))
    };
    let codec = |chosen: Option<&Value>, key: &str| {
        chosen
            .and_then(|entry| text_field(entry, key))
            .or_else(|| text_field(&info, key))
            .unwrap_or_else(unknown)
    };
    let sizes: Vec<f64> = requested
        .iter()
        .filter_map(|entry| {
            positive(entry.get("filesize")).or_else(|| positive(entry.get("filesize_approx")))
        })
        .collect();

    Some(ResolvedFormat {
        format_id: if format_ids.is_empty() {
            unknown()
        } else {
            format_ids.join("+")
        },
        resolution: resolution(dimension("width"), dimension("height")),
        video_codec: codec(video, "vcodec"),
        audio_codec: codec(audio, "acodec"),
        filesize: format_filesize((!sizes.is_empty()).then(|| sizes.iter().sum())),
    })
}

fn unknown() -> String {
    "unknown".to_string()
}

fn text_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn has_codec(entry: &Value, key: &str) -> bool {
    entry
        .get(key)
        .and_then(Value::as_str)
        .is_some_and(|codec| codec != "none")
}

fn truthy_number(value: &Value) -> bool {
    value.as_f64().is_some_and(|number| number != 0.0)
}

fn positive(value: Option<&Value>) -> Option<f64> {
    value
        .and_then(Value::as_f64)
        .filter(|number| *number > 0.0)
}

fn resolution(width: Option<&Value>, height: Option<&Value>) -> String {
    let width = width.and_then(Value::as_f64).filter(|w| *w > 0.0);
    let height = height.and_then(Value::as_f64).filter(|h| *h > 0.0);
    match (width, height) {
        (Some(width), Some(height)) => format!("{}x{}", width as i64, height as i64),
        _ => unknown(),
    }
}

/// How one line of download output is surfaced in the job log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// `[download]` line carrying a percentage; may replace the previous one.
    DownloadProgress,
    Error,
    Warning,
    Info,
    Debug,
}

impl LineKind {
    pub fn render(self, line: &str) -> String {
        match self {
            Self::DownloadProgress | Self::Info => line.to_string(),
            Self::Error => format!("ERROR: {line}"),
            Self::Warning => format!("WARNING: {line}"),
            Self::Debug => format!("DEBUG: {line}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassifiedLine {
    pub progress: Option<f64>,
    pub kind: LineKind,
}

pub fn classify_line(line: &str) -> ClassifiedLine {
    let progress = PROGRESS
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|value| value.as_str().parse::<f64>().ok());
    let lowered = line.to_lowercase();

    let kind = if progress.is_some() && line.starts_with("[download]") {
        LineKind::DownloadProgress
    } else if lowered.contains("error") {
        LineKind::Error
    } else if lowered.contains("warning") {
        LineKind::Warning
    } else if line.starts_with("[download]") || line.starts_with("[ffmpeg]") {
        LineKind::Info
    } else if DEBUG_PREFIXES
        .iter()
        .any(|prefix| lowered.starts_with(prefix))
    {
        LineKind::Debug
    } else {
        LineKind::Info
    };
    ClassifiedLine { progress, kind }
}

/// Runs `command` with stdout and stderr merged into one line stream. Blank
/// lines are skipped. Returns once the process has exited and both pipes are
/// drained.
pub fn run_streaming(mut command: Command, mut on_line: impl FnMut(&str)) -> Result<ExitStatus> {
    let program = command.get_program().to_string_lossy().into_owned();
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawning {program}"))?;

    let (tx, rx) = mpsc::channel::<String>();
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_line_reader(stdout, tx.clone())?);
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_line_reader(stderr, tx.clone())?);
    }
    drop(tx);

    for line in rx {
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            on_line(trimmed);
        }
    }
    for reader in readers {
        let _ = reader.join();
    }
    child
        .wait()
        .with_context(|| format!("waiting for {program}"))
}

fn spawn_line_reader<R>(stream: R, tx: mpsc::Sender<String>) -> Result<thread::JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name("yt-dlp-output".into())
        .spawn(move || {
            let mut reader = BufReader::new(stream);
            let mut buffer = Vec::new();
            loop {
                buffer.clear();
                match reader.read_until(b'\n', &mut buffer) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buffer);
                        // yt-dlp redraws progress with carriage returns.
                        for part in line.split('\r') {
                            if tx.send(part.to_string()).is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        })
        .context("spawning output reader")
}

/// Runs `command` to completion and returns its stdout. A non-zero exit is
/// an error carrying the tail of stderr.
pub fn run_captured(mut command: Command) -> Result<String> {
    let program = command.get_program().to_string_lossy().into_owned();
    let output = command
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("{program} could not be started"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or("no output");
        bail!("{program} exited with {}: {detail}", output.status);
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// `.part` and `.ytdl` files are left behind by interrupted downloads.
pub fn is_partial(path: &Path) -> bool {
    let name = path.to_string_lossy();
    name.ends_with(".part") || name.ends_with(".ytdl")
}

/// Per-stream fragments (`.f137.mp4`) and muxer temp files.
pub fn is_intermediate(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.ends_with(".temp") || name.contains(".temp.") || STREAM_FRAGMENT.is_match(&name)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreviewEntry {
    pub index: u32,
    pub title: String,
    pub id: String,
    pub duration: Option<i64>,
    pub duration_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaylistPreview {
    pub entries: Vec<PreviewEntry>,
    pub playlist_title: String,
    pub total_count: usize,
    pub truncated: bool,
    pub limit: usize,
}

pub fn clamp_preview_limit(limit: Option<i64>) -> usize {
    limit
        .map(|value| value.clamp(1, MAX_PREVIEW_ENTRIES as i64) as usize)
        .unwrap_or(DEFAULT_PREVIEW_ENTRIES)
}

/// Lists playlist entries without downloading anything.
pub fn fetch_playlist_preview(
    tools: &Tools,
    url: &str,
    cookies: Option<&Path>,
    limit: usize,
) -> Result<PlaylistPreview> {
    let limit = limit.clamp(1, MAX_PREVIEW_ENTRIES);
    let mut command = Command::new(&tools.yt_dlp);
    command.args([
        "--ignore-config",
        "--skip-download",
        "--dump-single-json",
        "--no-warnings",
        "--no-progress",
        "--playlist-end",
    ]);
    command.arg(limit.to_string());
    if let Some(cookies) = cookies {
        command.arg("--cookies").arg(cookies);
    }
    command.arg(url);

    let output = command
        .stdin(Stdio::null())
        .output()
        .context("yt-dlp executable not found.")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        bail!(
            "yt-dlp reported an error: {}",
            if stderr.is_empty() { "Unknown error" } else { stderr }
        );
    }
    parse_playlist_preview(&String::from_utf8_lossy(&output.stdout), limit)
}

pub fn parse_playlist_preview(stdout: &str, limit: usize) -> Result<PlaylistPreview> {
    let payload: Value = if stdout.trim().is_empty() {
        Value::Object(Default::default())
    } else {
        match serde_json::from_str(stdout) {
            Ok(value) => value,
            Err(_) => {
                let block = extract_first_json_block(stdout)
                    .ok_or_else(|| anyhow!("Failed to parse yt-dlp response."))?;
                serde_json::from_str(block).context("Failed to parse yt-dlp response.")?
            }
        }
    };

    let (raw_entries, playlist_title, declared_total) = match &payload {
        Value::Object(map) => {
            let title = map
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or("")
                .trim()
                .to_string();
            match map.get("entries").and_then(Value::as_array) {
                Some(entries) if map.get("_type").and_then(Value::as_str) == Some("playlist") => {
                    let total = map
                        .get("playlist_count")
                        .and_then(Value::as_u64)
                        .map(|count| count as usize)
                        .filter(|count| *count > 0)
                        .unwrap_or(entries.len());
                    (entries.clone(), title, total)
                }
                _ => (vec![payload.clone()], title, 1),
            }
        }
        _ => (Vec::new(), String::new(), 0),
    };

    let mut entries: Vec<PreviewEntry> = raw_entries
        .iter()
        .enumerate()
        .filter(|(_, raw)| raw.is_object())
        .map(|(position, raw)| preview_entry(raw, position as u32 + 1))
        .collect();
    entries.sort_by_key(|entry| entry.index);
    for (position, entry) in entries.iter_mut().enumerate() {
        entry.index = position as u32 + 1;
    }

    let total_count = if declared_total > 0 {
        declared_total
    } else {
        entries.len()
    };
    Ok(PlaylistPreview {
        truncated: entries.len() < total_count,
        entries,
        playlist_title,
        total_count,
        limit,
    })
}

fn preview_entry(raw: &Value, position: u32) -> PreviewEntry {
    let index = raw
        .get("playlist_index")
        .and_then(Value::as_u64)
        .filter(|index| *index > 0)
        .map(|index| index as u32)
        .unwrap_or(position);
    let duration = raw
        .get("duration")
        .and_then(Value::as_f64)
        .map(|seconds| seconds as i64);
    let duration_text = raw
        .get("duration_string")
        .and_then(|value| match value {
            Value::String(text) => Some(text.trim().to_string()),
            Value::Null => None,
            other => Some(other.to_string()),
        })
        .filter(|text| !text.is_empty())
        .unwrap_or_else(|| format_duration_label(duration));
    let title = text_field(raw, "title").unwrap_or_else(|| format!("Entry {index}"));
    PreviewEntry {
        index,
        title,
        id: text_field(raw, "id").unwrap_or_default(),
        duration,
        duration_text,
    }
}

/// Returns the first complete JSON object or array embedded in `text`.
pub fn extract_first_json_block(text: &str) -> Option<&str> {
    text.char_indices()
        .filter(|(_, ch)| *ch == '{' || *ch == '[')
        .find_map(|(start, _)| {
            let rest = &text[start..];
            let mut stream = serde_json::Deserializer::from_str(rest).into_iter::<Value>();
            match stream.next() {
                Some(Ok(_)) => Some(&rest[..stream.byte_offset()]),
                _ => None,
            }
        })
}

pub fn format_filesize(bytes: Option<f64>) -> String {
    let Some(mut size) = bytes.filter(|size| *size > 0.0) else {
        return unknown();
    };
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{size:.1} {}", UNITS[unit])
}

/// `"m:ss"` or `"h:mm:ss"`; empty for missing or non-positive durations.
pub fn format_duration_label(seconds: Option<i64>) -> String {
    let Some(total) = seconds.filter(|total| *total > 0) else {
        return String::new();
    };
    let (minutes, seconds) = (total / 60, total % 60);
    let (hours, minutes) = (minutes / 60, minutes % 60);
    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::tempdir;

    /// Writes an executable bash script standing in for an external tool.
    pub(crate) fn install_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/usr/bin/env bash\nset -u\n{body}\n")).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn tools_with(yt_dlp: PathBuf) -> Tools {
        Tools {
            yt_dlp,
            ffmpeg: None,
        }
    }

    #[test]
    fn classify_routes_lines_by_content() {
        let progress = classify_line("[download]  42.0% of 10.00MiB at 1.00MiB/s");
        assert_eq!(progress.kind, LineKind::DownloadProgress);
        assert_eq!(progress.progress, Some(42.0));

        let merger = classify_line("[Merger] Merging formats: 100%");
        assert_eq!(merger.progress, Some(100.0));
        assert_eq!(merger.kind, LineKind::Info);

        assert_eq!(
            classify_line("ERROR: [youtube] abc: Video unavailable").kind,
            LineKind::Error
        );
        assert_eq!(
            classify_line("WARNING: falling back").kind,
            LineKind::Warning
        );
        assert_eq!(
            classify_line("[download] Destination: x.mp4").kind,
            LineKind::Info
        );
        assert_eq!(
            classify_line("[youtube] abc: Downloading webpage").kind,
            LineKind::Debug
        );
        assert_eq!(classify_line("Deleting original file").kind, LineKind::Info);
        assert_eq!(LineKind::Debug.render("[info] x"), "DEBUG: [info] x");
    }

    #[test]
    fn probe_reads_requested_formats() {
        let stdout = concat!(
            "noise\n",
            r#"{"format_id":"137+140","width":1920,"height":1080,"requested_formats":["#,
            r#"{"format_id":"137","vcodec":"avc1.640028","acodec":"none","width":1920,"height":1080,"filesize":1048576},"#,
            r#"{"format_id":"140","vcodec":"none","acodec":"mp4a.40.2","filesize_approx":1048576}]}"#,
            "\n",
        );
        let format = parse_format_probe(stdout).unwrap();
        assert_eq!(format.format_id, "137+140");
        assert_eq!(format.resolution, "1920x1080");
        assert_eq!(format.video_codec, "avc1.640028");
        assert_eq!(format.audio_codec, "mp4a.40.2");
        assert_eq!(format.filesize, "2.0 MiB");
        assert_eq!(
            format.metadata_lines(),
            vec![
                "Format ID: 137+140",
                "Resolution: 1920x1080",
                "Video Codec: avc1.640028",
                "Audio Codec: mp4a.40.2",
                "Filesize: 2.0 MiB",
            ]
        );
    }

    #[test]
    fn probe_handles_progressive_format_and_silence() {
        let format =
            parse_format_probe(r#"{"format_id":18,"vcodec":"avc1","acodec":"mp4a"}"#).unwrap();
        assert_eq!(format.format_id, "18");
        assert_eq!(format.resolution, "unknown");
        assert_eq!(format.filesize, "unknown");
        assert_eq!(format.metadata_lines().len(), 3);
        assert!(parse_format_probe("nothing useful\n").is_none());
    }

    #[test]
    fn streaming_merges_stdout_and_stderr() {
        let dir = tempdir().unwrap();
        let script = install_script(
            dir.path(),
            "talker",
            "echo out-1\necho err-1 >&2\nprintf 'a\\rb\\n'\necho\nexit 3",
        );
        let mut lines = Vec::new();
        let status = run_streaming(Command::new(script), |line| lines.push(line.to_string()))
            .unwrap();
        assert_eq!(status.code(), Some(3));
        lines.sort();
        assert_eq!(lines, vec!["a", "b", "err-1", "out-1"]);
    }

    #[test]
    fn streaming_reports_missing_program() {
        let dir = tempdir().unwrap();
        let err = run_streaming(Command::new(dir.path().join("absent")), |_| {}).unwrap_err();
        assert!(format!("{err:#}").contains("spawning"));
    }

    #[test]
    fn title_lookup_falls_back_on_failure() {
        let dir = tempdir().unwrap();
        let ok = install_script(
            dir.path(),
            "yt-ok",
            "for a in \"$@\"; do [[ $a == --get-title ]] && echo '  Heat Trailer  '; [[ $a == '%(playlist_title)s' ]] && echo 'Extras List'; done; exit 0",
        );
        let tools = tools_with(ok);
        assert_eq!(
            fetch_title(&tools, "u", None, false),
            TitleLookup::Found("Heat Trailer".into())
        );
        assert_eq!(
            fetch_title(&tools, "u", None, true),
            TitleLookup::Found("Extras List".into())
        );

        let failing = install_script(dir.path(), "yt-bad", "echo 'ERROR: nope' >&2; exit 1");
        match fetch_title(&tools_with(failing), "u", None, false) {
            TitleLookup::Fallback { reason } => assert!(reason.contains("ERROR: nope")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn cookies_are_passed_first() {
        let tools = tools_with(PathBuf::from("yt-dlp"));
        let command = tools.yt_dlp_command(Some(Path::new("/cfg/cookies.txt")));
        let args: Vec<_> = command.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, vec!["--cookies", "/cfg/cookies.txt"]);
    }

    #[test]
    fn intermediate_and_partial_detection() {
        assert!(is_intermediate(Path::new("/x/Clip.f137.mp4")));
        assert!(is_intermediate(Path::new("/x/Clip.temp.mp4")));
        assert!(is_intermediate(Path::new("/x/Clip.temp")));
        assert!(!is_intermediate(Path::new("/x/Clip.mp4")));
        assert!(!is_intermediate(Path::new("/x/Clip.f137")));
        assert!(is_partial(Path::new("/x/Clip.mp4.part")));
        assert!(is_partial(Path::new("/x/Clip.mp4.ytdl")));
        assert!(!is_partial(Path::new("/x/Clip.mp4")));
    }

    #[test]
    fn preview_parses_playlists_and_single_videos() {
        let playlist = r#"{"_type":"playlist","title":" Extras ","playlist_count":5,"entries":[
            {"playlist_index":3,"title":"Third","id":"c","duration":3725},
            {"playlist_index":1,"title":"","id":"a","duration":59,"duration_string":"0:59"},
            "junk"
        ]}"#;
        let preview = parse_playlist_preview(playlist, 2).unwrap();
        assert_eq!(preview.playlist_title, "Extras");
        assert_eq!(preview.total_count, 5);
        assert!(preview.truncated);
        assert_eq!(preview.entries[0].title, "Entry 1");
        assert_eq!(preview.entries[0].duration_text, "0:59");
        assert_eq!(preview.entries[1].index, 2);
        assert_eq!(preview.entries[1].duration_text, "1:02:05");

        let single = parse_playlist_preview(
            "WARNING: noise\n{\"title\":\"Solo\",\"id\":\"s\",\"duration\":61.5}\n",
            50,
        )
        .unwrap();
        assert_eq!(single.entries.len(), 1);
        assert_eq!(single.entries[0].duration, Some(61));
        assert_eq!(single.entries[0].duration_text, "1:01");
        assert!(!single.truncated);

        assert!(parse_playlist_preview("not json at all", 5).is_err());
    }

    #[test]
    fn preview_limit_is_clamped() {
        assert_eq!(clamp_preview_limit(None), 50);
        assert_eq!(clamp_preview_limit(Some(0)), 1);
        assert_eq!(clamp_preview_limit(Some(900)), 200);
    }

    #[test]
    fn json_block_extraction_skips_garbage() {
        assert_eq!(
            extract_first_json_block("x { broken [1, 2] tail"),
            Some("[1, 2]")
        );
        assert_eq!(
            extract_first_json_block("pre {\"a\": {\"b\": 1}} post"),
            Some("{\"a\": {\"b\": 1}}")
        );
        assert_eq!(extract_first_json_block("none here"), None);
    }

    #[test]
    fn sizes_and_durations_are_human_readable() {
        assert_eq!(format_filesize(None), "unknown");
        assert_eq!(format_filesize(Some(0.0)), "unknown");
        assert_eq!(format_filesize(Some(512.0)), "512.0 B");
        assert_eq!(format_filesize(Some(1536.0)), "1.5 KiB");
        assert_eq!(format_duration_label(Some(0)), "");
        assert_eq!(format_duration_label(Some(75)), "1:15");
        assert_eq!(format_duration_label(Some(3600)), "1:00:00");
    }
}
