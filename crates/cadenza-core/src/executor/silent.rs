use std::io::Cursor;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use super::{GenerationExecutor, GenerationRequest, ProgressReporter};
use crate::error::ExecutionError;

/// Renders silent 16-bit PCM WAV files of the requested length.
///
/// Useful for running the service without a model: every task completes
/// with `batch_infer_num` well-formed artifacts.
#[derive(Clone, Debug)]
pub struct SilentExecutor {
    sample_rate: u32,
    channels: u16,
    step_delay: Duration,
}

impl Default for SilentExecutor {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            channels: 2,
            step_delay: Duration::ZERO,
        }
    }
}

impl SilentExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate.max(1);
        self
    }

    pub fn with_channels(mut self, channels: u16) -> Self {
        self.channels = channels.max(1);
        self
    }

    /// Pause after each rendered item, to make progress observable.
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }
}

fn render(sample_rate: u32, channels: u16, seconds: u32) -> Result<Bytes, ExecutionError> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let frames = u64::from(sample_rate) * u64::from(seconds);
    let mut buf = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut buf, spec)
            .map_err(|e| ExecutionError::Encode(e.to_string()))?;
        for _ in 0..frames * u64::from(channels) {
            writer
                .write_sample(0i16)
                .map_err(|e| ExecutionError::Encode(e.to_string()))?;
        }
        writer
            .finalize()
            .map_err(|e| ExecutionError::Encode(e.to_string()))?;
    }
    Ok(Bytes::from(buf.into_inner()))
}

#[async_trait]
impl GenerationExecutor for SilentExecutor {
    fn name(&self) -> &'static str {
        "silent"
    }

    async fn generate(
        &self,
        request: GenerationRequest,
        progress: ProgressReporter,
    ) -> Result<Vec<Bytes>, ExecutionError> {
        let batch = request.batch_infer_num.max(1);
        let mut artifacts = Vec::with_capacity(batch as usize);
        for item in 0..batch {
            let (rate, channels, seconds) = (self.sample_rate, self.channels, request.audio_length);
            let audio = tokio::task::spawn_blocking(move || render(rate, channels, seconds))
                .await
                .map_err(|e| ExecutionError::Failed(format!("render task panicked: {e}")))??;
            artifacts.push(audio);

            let done = (item + 1) * 100 / batch;
            progress.report(done.min(100) as u8);
            debug!(task_id = %request.task_id, item, batch, "rendered silent audio");

            if !self.step_delay.is_zero() {
                tokio::time::sleep(self.step_delay).await;
            }
        }
        Ok(artifacts)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::executor::StyleInput;
    use crate::task::{TaskId, TaskKind};
    use std::path::PathBuf;

    #[tokio::test]
    async fn renders_one_wav_per_batch_item() {
        let exec = SilentExecutor::new().with_sample_rate(8_000).with_channels(1);
        let request = GenerationRequest {
            task_id: TaskId::new(),
            kind: TaskKind::Generate,
            lyrics_path: PathBuf::from("lyrics.lrc"),
            style: StyleInput::Prompt("ambient".into()),
            audio_length: 95,
            chunked: true,
            batch_infer_num: 2,
            edit: None,
        };
        let (reporter, rx) = ProgressReporter::channel();

        let audio = exec.generate(request, reporter).await.unwrap();

        assert_eq!(audio.len(), 2);
        assert_eq!(*rx.borrow(), 100);
        let reader = hound::WavReader::new(Cursor::new(audio[0].to_vec())).unwrap();
        assert_eq!(reader.spec().sample_rate, 8_000);
        assert_eq!(reader.spec().channels, 1);
        assert_eq!(reader.duration(), 8_000 * 95);
    }
}
