//! H.264/H.265 through an `ffmpeg` child process producing fragmented MP4
//! on stdout, so the container can be streamed into sinks as it is built.

use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Stdio};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use ffmpeg_sidecar::command::FfmpegCommand;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{SessionGate, TICKS_PER_SECOND, Ticks, VideoCodec, parse_options};
use crate::bitmap::BitmapData;
use crate::convert;
use crate::env_config::{FFMPEG_PATH_VAR, env_var_path};
use crate::error::{CaptureError, CaptureResult};

const STDOUT_CHUNK: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VideoProfile {
    H264,
    H265,
}

impl VideoProfile {
    const fn id(self) -> &'static str {
        match self {
            Self::H264 => "h264",
            Self::H265 => "h265",
        }
    }

    const fn default_encoder(self) -> &'static str {
        match self {
            Self::H264 => "libx264",
            Self::H265 => "libx265",
        }
    }

    fn default_options(self) -> FfmpegOptions {
        match self {
            Self::H264 => FfmpegOptions {
                frame_rate: 60,
                bitrate_kbps: 8_000,
                encoder: None,
                preset: None,
            },
            Self::H265 => FfmpegOptions {
                frame_rate: 30,
                bitrate_kbps: 4_000,
                encoder: None,
                preset: None,
            },
        }
    }
}

/// Options bag for the ffmpeg codecs. Omitted fields keep the profile's
/// defaults.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FfmpegOptionsPatch {
    frame_rate: Option<u32>,
    bitrate_kbps: Option<u32>,
    encoder: Option<String>,
    preset: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FfmpegOptions {
    pub frame_rate: u32,
    pub bitrate_kbps: u32,
    /// ffmpeg encoder name, e.g. `h264_nvenc`. Defaults to the software
    /// encoder for the profile.
    pub encoder: Option<String>,
    pub preset: Option<String>,
}

struct FfmpegSession {
    child: Child,
    stdin: Option<ChildStdin>,
    chunks: Receiver<Vec<u8>>,
    reader: Option<JoinHandle<()>>,
    width: u32,
    height: u32,
    first_timestamp: Option<Ticks>,
    frames_written: u64,
}

pub struct FfmpegCodec {
    profile: VideoProfile,
    options: FfmpegOptions,
    gate: SessionGate,
    session: Option<FfmpegSession>,
}

impl FfmpegCodec {
    pub fn new(profile: VideoProfile) -> Self {
        Self {
            profile,
            options: profile.default_options(),
            gate: SessionGate::default(),
            session: None,
        }
    }

    pub fn options(&self) -> &FfmpegOptions {
        &self.options
    }

    fn ffmpeg_args(&self, width: u32, height: u32) -> Vec<String> {
        let options = &self.options;
        let mut args: Vec<String> = [
            "-hide_banner",
            "-loglevel",
            "error",
            "-f",
            "rawvideo",
            "-pix_fmt",
            "bgra",
            "-s",
        ]
        .iter()
        .map(|arg| arg.to_string())
        .collect();
        args.push(format!("{width}x{height}"));
        args.extend(["-r".to_string(), options.frame_rate.to_string()]);
        args.extend(["-i".to_string(), "-".to_string()]);

        let encoder = options
            .encoder
            .clone()
            .unwrap_or_else(|| self.profile.default_encoder().to_string());
        args.extend(["-c:v".to_string(), encoder]);
        if let Some(preset) = &options.preset {
            args.extend(["-preset".to_string(), preset.clone()]);
        }
        args.extend(["-b:v".to_string(), format!("{}k", options.bitrate_kbps)]);
        for arg in [
            "-pix_fmt",
            "yuv420p",
            "-movflags",
            "frag_keyframe+empty_moov+default_base_moof",
            "-f",
            "mp4",
            "-",
        ] {
            args.push(arg.to_string());
        }
        args
    }
}

fn ffmpeg_binary() -> PathBuf {
    env_var_path(FFMPEG_PATH_VAR).unwrap_or_else(ffmpeg_sidecar::paths::ffmpeg_path)
}

/// How many input frames ffmpeg should have received once the frame at
/// `timestamp` is written, given a constant input rate.
fn frames_due(first: Ticks, timestamp: Ticks, frame_rate: u32) -> u64 {
    let elapsed = u128::from(timestamp.saturating_sub(first));
    let ticks = u128::from(TICKS_PER_SECOND);
    let due = (elapsed * u128::from(frame_rate) + ticks / 2) / ticks;
    u64::try_from(due).unwrap_or(u64::MAX).saturating_add(1)
}

fn spawn_stdout_reader(
    mut stdout: impl Read + Send + 'static,
    chunks: Sender<Vec<u8>>,
) -> CaptureResult<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("captain-ffmpeg-out".into())
        .spawn(move || {
            let mut buf = vec![0u8; STDOUT_CHUNK];
            loop {
                match stdout.read(&mut buf) {
                    Ok(0) => break,
                    Ok(read) => {
                        if chunks.send(buf[..read].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        warn!(error = %err, "ffmpeg stdout read failed");
                        break;
                    }
                }
            }
        })
        .map_err(CaptureError::Io)
}

fn spawn_stderr_logger(stderr: impl Read + Send + 'static) -> CaptureResult<()> {
    std::thread::Builder::new()
        .name("captain-ffmpeg-log".into())
        .spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                warn!(target: "captain_capture::ffmpeg", "{line}");
            }
        })
        .map(|_| ())
        .map_err(CaptureError::Io)
}

fn forward(chunks: &Receiver<Vec<u8>>, output: &mut dyn Write) -> CaptureResult<()> {
    for chunk in chunks.try_iter() {
        output.write_all(&chunk)?;
    }
    Ok(())
}

impl VideoCodec for FfmpegCodec {
    fn media_type(&self) -> &'static str {
        "video/mp4"
    }

    fn file_extension(&self) -> &'static str {
        "mp4"
    }

    fn frame_rate(&self) -> u32 {
        self.options.frame_rate
    }

    fn apply_options(&mut self, options: &serde_json::Value) -> CaptureResult<()> {
        let codec = self.profile.id();
        self.gate.ensure_configurable(codec)?;
        let patch: FfmpegOptionsPatch = parse_options(codec, options)?;

        let mut next = self.profile.default_options();
        if let Some(frame_rate) = patch.frame_rate {
            next.frame_rate = frame_rate;
        }
        if let Some(bitrate) = patch.bitrate_kbps {
            next.bitrate_kbps = bitrate;
        }
        next.encoder = patch.encoder;
        next.preset = patch.preset;
        if next.frame_rate == 0 || next.bitrate_kbps == 0 {
            return Err(CaptureError::InvalidConfig(format!(
                "{codec} needs a positive frame_rate and bitrate_kbps"
            )));
        }
        self.options = next;
        Ok(())
    }

    fn initialize(
        &mut self,
        width: u32,
        height: u32,
        _output: &mut dyn Write,
    ) -> CaptureResult<()> {
        let codec = self.profile.id();
        // yuv420p needs even dimensions.
        let (width, height) = (width & !1, height & !1);
        if width == 0 || height == 0 {
            return Err(CaptureError::CodecInitialization(format!(
                "{codec} cannot encode {width}x{height} frames"
            )));
        }
        self.gate.ensure_configurable(codec)?;

        let binary = ffmpeg_binary();
        let mut command = FfmpegCommand::new_with_path(&binary);
        command.args(self.ffmpeg_args(width, height));
        let inner = command.as_inner_mut();
        inner
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = inner.spawn().map_err(|err| {
            CaptureError::CodecInitialization(format!(
                "{codec}: failed to start {}: {err}",
                binary.display()
            ))
        })?;

        let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let (Some(stdin), Some(stdout), Some(stderr)) = pipes else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(CaptureError::CodecInitialization(format!(
                "{codec}: ffmpeg pipes unavailable"
            )));
        };
        let (sender, chunks) = crossbeam_channel::unbounded();
        let reader = spawn_stdout_reader(stdout, sender)?;
        spawn_stderr_logger(stderr)?;

        self.gate.open(codec)?;
        debug!(
            codec,
            width,
            height,
            frame_rate = self.options.frame_rate,
            bitrate_kbps = self.options.bitrate_kbps,
            "ffmpeg session started"
        );
        self.session = Some(FfmpegSession {
            child,
            stdin: Some(stdin),
            chunks,
            reader: Some(reader),
            width,
            height,
            first_timestamp: None,
            frames_written: 0,
        });
        Ok(())
    }

    fn encode(
        &mut self,
        bitmap: &BitmapData,
        timestamp: Ticks,
        output: &mut dyn Write,
    ) -> CaptureResult<()> {
        let codec = self.profile.id();
        self.gate.admit(codec, timestamp)?;
        let frame_rate = self.options.frame_rate;
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| CaptureError::InvalidState(format!("{codec} session is not open")))?;

        let first = *session.first_timestamp.get_or_insert(timestamp);
        let due = frames_due(first, timestamp, frame_rate);
        if due > session.frames_written {
            let pixels = convert::to_packed_bgra_cropped(bitmap, session.width, session.height)?;
            let stdin = session
                .stdin
                .as_mut()
                .ok_or_else(|| CaptureError::InvalidState(format!("{codec} input closed")))?;
            // Repeat the frame to cover a capture gap; late frames are dropped.
            while session.frames_written < due {
                stdin.write_all(&pixels).map_err(|err| {
                    CaptureError::Encoding(format!("{codec}: writing frame: {err}"))
                })?;
                session.frames_written += 1;
            }
        }
        forward(&session.chunks, output)
    }

    fn finalize(&mut self, output: &mut dyn Write) -> CaptureResult<()> {
        let codec = self.profile.id();
        self.gate.close(codec)?;
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };

        drop(session.stdin.take());
        if let Some(reader) = session.reader.take() {
            if reader.join().is_err() {
                warn!(codec, "ffmpeg stdout reader panicked");
            }
        }
        for chunk in session.chunks.iter() {
            output.write_all(&chunk)?;
        }
        output.flush()?;

        let status = session.child.wait()?;
        debug!(codec, frames = session.frames_written, %status, "ffmpeg session finished");
        if !status.success() {
            return Err(CaptureError::Encoding(format!(
                "{codec}: ffmpeg exited with {status}"
            )));
        }
        Ok(())
    }
}

impl Drop for FfmpegCodec {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.take() {
            drop(session.stdin.take());
            if let Err(err) = session.child.kill() {
                debug!(error = %err, "ffmpeg already exited");
            }
            let _ = session.child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn profiles_carry_their_defaults() {
        let h264 = FfmpegCodec::new(VideoProfile::H264);
        assert_eq!((h264.options().frame_rate, h264.options().bitrate_kbps), (60, 8_000));
        let h265 = FfmpegCodec::new(VideoProfile::H265);
        assert_eq!((h265.options().frame_rate, h265.options().bitrate_kbps), (30, 4_000));
    }

    #[test]
    fn options_override_only_named_fields() -> CaptureResult<()> {
        let mut codec = FfmpegCodec::new(VideoProfile::H265);
        codec.apply_options(&json!({ "bitrate_kbps": 2500, "encoder": "hevc_nvenc" }))?;
        assert_eq!(codec.options().frame_rate, 30);
        assert_eq!(codec.options().bitrate_kbps, 2500);
        assert!(
            codec
                .apply_options(&json!({ "frame_rate": 0 }))
                .is_err()
        );
        assert!(codec.apply_options(&json!({ "crf": 18 })).is_err());
        Ok(())
    }

    #[test]
    fn arguments_describe_raw_input_and_fragmented_output() {
        let codec = FfmpegCodec::new(VideoProfile::H264);
        let args = codec.ffmpeg_args(1920, 1080);
        let joined = args.join(" ");
        assert!(joined.contains("-f rawvideo -pix_fmt bgra -s 1920x1080 -r 60 -i -"));
        assert!(joined.contains("-c:v libx264"));
        assert!(joined.contains("-b:v 8000k"));
        assert!(joined.ends_with("-f mp4 -"));
    }

    #[test]
    fn timestamps_map_onto_constant_rate() {
        let second = TICKS_PER_SECOND;
        assert_eq!(frames_due(0, 0, 30), 1);
        assert_eq!(frames_due(0, second / 30, 30), 2);
        // A late frame after a 100 ms stall covers three input slots.
        assert_eq!(frames_due(0, second / 10, 30), 4);
        // Frames arriving faster than the input rate are not due yet.
        assert_eq!(frames_due(0, second / 100, 30), 1);
    }
}
