use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{GenerationExecutor, GenerationRequest, ProgressReporter, StyleInput};
use crate::error::ExecutionError;
use crate::task::{segments_to_json, TaskId, TaskKind};

/// Lines of stderr kept for the failure message.
const TAIL_LINES: usize = 20;

/// Runs an external inference script once per task.
///
/// The script receives inference flags (`--lrc-path`,
/// `--ref-prompt`/`--ref-audio-path`, `--audio-length`, `--output-dir`, ...)
/// after any configured base arguments, writes `*.wav` files into the output
/// directory, and may print `NN%` progress markers on stderr.
#[derive(Clone, Debug)]
pub struct CommandExecutor {
    program: PathBuf,
    base_args: Vec<OsString>,
    working_dir: Option<PathBuf>,
    scratch_root: PathBuf,
}

impl CommandExecutor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
            working_dir: None,
            scratch_root: std::env::temp_dir(),
        }
    }

    /// Arguments placed before the generated flags, e.g. the script path.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.base_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Where per-task output directories are created. Defaults to the
    /// system temp directory.
    pub fn with_scratch_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_root = dir.into();
        self
    }

    fn flags(&self, request: &GenerationRequest, output_dir: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["--lrc-path".into(), request.lyrics_path.clone().into()];
        match &request.style {
            StyleInput::Prompt(text) => {
                args.push("--ref-prompt".into());
                args.push(text.into());
            }
            StyleInput::Audio(path) => {
                args.push("--ref-audio-path".into());
                args.push(path.clone().into());
            }
        }
        args.push("--audio-length".into());
        args.push(request.audio_length.to_string().into());
        args.push("--output-dir".into());
        args.push(output_dir.into());
        if request.chunked {
            args.push("--chunked".into());
        }
        args.push("--batch-infer-num".into());
        args.push(request.batch_infer_num.to_string().into());
        if let Some(edit) = &request.edit {
            args.push("--edit".into());
            args.push("--ref-song".into());
            args.push(edit.ref_song_path.clone().into());
            args.push("--edit-segments".into());
            args.push(segments_to_json(&edit.segments).into());
        }
        args
    }

    async fn run(
        &self,
        request: &GenerationRequest,
        output_dir: &Path,
        progress: &ProgressReporter,
    ) -> Result<Vec<Bytes>, ExecutionError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.base_args)
            .args(self.flags(request, output_dir))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            ExecutionError::Failed(format!(
                "failed to start {}: {e}",
                self.program.display()
            ))
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecutionError::Failed("stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExecutionError::Failed("stderr not captured".into()))?;

        let task_id = request.task_id;
        let (out, err) = tokio::join!(
            scan(stdout, LineScanner::new(task_id, "stdout", None)),
            scan(stderr, LineScanner::new(task_id, "stderr", Some(progress.clone()))),
        );
        out?;
        let tail = err?;
        let status = child.wait().await?;

        if !status.success() {
            let mut message = format!("{} exited with {status}", self.program.display());
            if !tail.is_empty() {
                message.push_str(": ");
                message.push_str(&tail.into_iter().collect::<Vec<_>>().join("\n"));
            }
            return Err(ExecutionError::Failed(message));
        }

        collect_wavs(output_dir).await
    }
}

#[async_trait]
impl GenerationExecutor for CommandExecutor {
    fn name(&self) -> &'static str {
        "command"
    }

    async fn generate(
        &self,
        request: GenerationRequest,
        progress: ProgressReporter,
    ) -> Result<Vec<Bytes>, ExecutionError> {
        fs::create_dir_all(&self.scratch_root).await?;
        // Removed on drop as well, so a timed-out or aborted run leaves nothing behind.
        let scratch = tempfile::Builder::new()
            .prefix(&format!("cadenza-{}-", request.task_id))
            .tempdir_in(&self.scratch_root)?;
        info!(
            task_id = %request.task_id,
            edit = request.kind == TaskKind::Edit,
            program = %self.program.display(),
            "starting inference command"
        );

        let result = self.run(&request, scratch.path(), &progress).await;

        if let Err(e) = scratch.close() {
            warn!(task_id = %request.task_id, error = %e, "failed to remove scratch directory");
        }
        result
    }
}

async fn scan<R: AsyncRead + Unpin>(
    reader: R,
    mut scanner: LineScanner,
) -> std::io::Result<VecDeque<String>> {
    let mut reader = BufReader::new(reader);
    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            break;
        }
        let len = chunk.len();
        scanner.feed(chunk);
        reader.consume(len);
    }
    scanner.finish();
    Ok(scanner.tail)
}

/// Splits process output on `\n` and `\r` (progress bars redraw with the
/// latter), logs each line and keeps the last few.
struct LineScanner {
    task_id: TaskId,
    stream: &'static str,
    progress: Option<ProgressReporter>,
    line: Vec<u8>,
    tail: VecDeque<String>,
}

impl LineScanner {
    fn new(task_id: TaskId, stream: &'static str, progress: Option<ProgressReporter>) -> Self {
        Self {
            task_id,
            stream,
            progress,
            line: Vec::new(),
            tail: VecDeque::with_capacity(TAIL_LINES),
        }
    }

    fn feed(&mut self, chunk: &[u8]) {
        for &b in chunk {
            if b == b'\n' || b == b'\r' {
                self.finish();
            } else {
                self.line.push(b);
            }
        }
    }

    fn finish(&mut self) {
        if self.line.is_empty() {
            return;
        }
        let line = String::from_utf8_lossy(&self.line).trim().to_owned();
        self.line.clear();
        if line.is_empty() {
            return;
        }
        debug!(task_id = %self.task_id, stream = self.stream, "{line}");
        if let (Some(progress), Some(pct)) = (&self.progress, parse_percent(&line)) {
            progress.report(pct);
        }
        if self.tail.len() == TAIL_LINES {
            self.tail.pop_front();
        }
        self.tail.push_back(line);
    }
}

/// The last `NN%` marker on a line, e.g. `45` in `Sampling:  45%|####`.
fn parse_percent(line: &str) -> Option<u8> {
    line.match_indices('%')
        .filter_map(|(at, _)| {
            let head = &line[..at];
            let start = head
                .char_indices()
                .rev()
                .find(|(_, c)| !c.is_ascii_digit())
                .map_or(0, |(i, c)| i + c.len_utf8());
            head[start..].parse::<u8>().ok().filter(|p| *p <= 100)
        })
        .last()
}

async fn collect_wavs(dir: &Path) -> Result<Vec<Bytes>, ExecutionError> {
    let mut paths = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_wav = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("wav"));
        if is_wav && entry.file_type().await?.is_file() {
            paths.push(path);
        }
    }
    paths.sort();

    let mut artifacts = Vec::with_capacity(paths.len());
    for path in paths {
        artifacts.push(Bytes::from(fs::read(&path).await?));
    }
    Ok(artifacts)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::executor::EditRequest;
    use crate::task::parse_edit_segments;
    use std::time::Duration;

    fn request(style: StyleInput) -> GenerationRequest {
        GenerationRequest {
            task_id: TaskId::new(),
            kind: TaskKind::Generate,
            lyrics_path: PathBuf::from("/in/lyrics.lrc"),
            style,
            audio_length: 95,
            chunked: true,
            batch_infer_num: 1,
            edit: None,
        }
    }

    fn strings(args: Vec<OsString>) -> Vec<String> {
        args.into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn percent_markers() {
        assert_eq!(parse_percent("Sampling:  45%|████▌     | 45/100"), Some(45));
        assert_eq!(parse_percent("█100%"), Some(100));
        assert_eq!(parse_percent("batch 1 done 10% then 60%"), Some(60));
        assert_eq!(parse_percent("no markers here"), None);
        assert_eq!(parse_percent("% alone"), None);
        assert_eq!(parse_percent("300%"), None);
    }

    #[test]
    fn generate_flags() {
        let exec = CommandExecutor::new("python3");
        let args = strings(exec.flags(
            &request(StyleInput::Prompt("lofi beats".into())),
            Path::new("/tmp/out"),
        ));
        assert_eq!(
            args,
            [
                "--lrc-path", "/in/lyrics.lrc",
                "--ref-prompt", "lofi beats",
                "--audio-length", "95",
                "--output-dir", "/tmp/out",
                "--chunked",
                "--batch-infer-num", "1",
            ]
        );
    }

    #[test]
    fn edit_flags() {
        let exec = CommandExecutor::new("python3");
        let mut req = request(StyleInput::Audio(PathBuf::from("/in/ref_audio_a.wav")));
        req.kind = TaskKind::Edit;
        req.chunked = false;
        req.edit = Some(EditRequest {
            ref_song_path: PathBuf::from("/in/ref_song_s.wav"),
            segments: parse_edit_segments("[[-1,25],[50,-1]]").unwrap(),
        });
        let args = strings(exec.flags(&req, Path::new("/tmp/out")));

        assert!(args.windows(2).any(|w| w == ["--ref-audio-path", "/in/ref_audio_a.wav"]));
        assert!(!args.contains(&"--chunked".to_owned()));
        let edit_at = args.iter().position(|a| a == "--edit").unwrap();
        assert_eq!(
            &args[edit_at..],
            ["--edit", "--ref-song", "/in/ref_song_s.wav", "--edit-segments", "[[-1.0,25.0],[50.0,-1.0]]"]
        );
    }

    #[test]
    fn scanner_keeps_a_bounded_tail_and_reports_progress() {
        let (reporter, rx) = ProgressReporter::channel();
        let mut scanner = LineScanner::new(TaskId::new(), "stderr", Some(reporter));
        scanner.feed(b"loading\r 10%|#\r 55%|###\n");
        for i in 0..30 {
            scanner.feed(format!("line {i}\n").as_bytes());
        }
        scanner.feed(b"partial");
        scanner.finish();

        assert_eq!(*rx.borrow(), 55);
        assert_eq!(scanner.tail.len(), TAIL_LINES);
        assert_eq!(scanner.tail.back().map(String::as_str), Some("partial"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_script_and_collects_wavs() {
        let scratch = tempfile::tempdir().unwrap();
        let script = r#"
            while [ $# -gt 0 ]; do
                if [ "$1" = "--output-dir" ]; then out="$2"; fi
                shift
            done
            echo " 20%|##" >&2
            echo " 80%|########" >&2
            printf 'second' > "$out/output_1.wav"
            printf 'first' > "$out/output_0.wav"
            printf 'ignored' > "$out/notes.txt"
        "#;
        let exec = CommandExecutor::new("sh")
            .with_args(["-c", script, "infer"])
            .with_scratch_root(scratch.path());
        let (reporter, _rx) = ProgressReporter::channel();

        let audio = exec
            .generate(request(StyleInput::Prompt("x".into())), reporter.clone())
            .await
            .unwrap();

        assert_eq!(audio, vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")]);
        assert_eq!(reporter.current(), 80);
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_carries_stderr_tail() {
        let scratch = tempfile::tempdir().unwrap();
        let exec = CommandExecutor::new("sh")
            .with_args(["-c", "echo 'CUDA out of memory' >&2; exit 3", "infer"])
            .with_scratch_root(scratch.path());

        let err = exec
            .generate(request(StyleInput::Prompt("x".into())), ProgressReporter::detached())
            .await
            .unwrap_err();
        match err {
            ExecutionError::Failed(message) => assert!(message.contains("CUDA out of memory")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn abandoned_run_removes_its_scratch_directory() {
        let scratch = tempfile::tempdir().unwrap();
        let exec = CommandExecutor::new("sh")
            .with_args(["-c", "sleep 5", "infer"])
            .with_scratch_root(scratch.path());

        let run = exec.generate(request(StyleInput::Prompt("x".into())), ProgressReporter::detached());
        let outcome = tokio::time::timeout(Duration::from_millis(200), run).await;

        assert!(outcome.is_err());
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn missing_program_fails_to_start() {
        let scratch = tempfile::tempdir().unwrap();
        let exec = CommandExecutor::new("/nonexistent/cadenza-infer").with_scratch_root(scratch.path());
        let err = exec
            .generate(request(StyleInput::Prompt("x".into())), ProgressReporter::detached())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to start"));
    }
}
