use std::io::Write;
use std::sync::{Arc, Mutex};

use image::codecs::gif::{GifEncoder, Repeat};
use image::{Delay, Frame, RgbaImage};
use serde::{Deserialize, Serialize};

use super::{SessionGate, TICKS_PER_SECOND, Ticks, VideoCodec, parse_options};
use crate::bitmap::BitmapData;
use crate::error::{CaptureError, CaptureResult};

const CODEC: &str = "gif-video";
const TICKS_PER_MILLISECOND: Ticks = TICKS_PER_SECOND / 1000;
/// Most viewers clamp shorter delays up to 100 ms.
const MIN_DELAY_MS: u32 = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GifVideoOptions {
    pub frame_rate: u32,
    /// Quantization speed, 1 (best) to 30 (fastest).
    pub speed: i32,
    /// Loop forever when `true`, play once otherwise.
    pub repeat: bool,
}

impl Default for GifVideoOptions {
    fn default() -> Self {
        Self {
            frame_rate: 10,
            speed: 10,
            repeat: true,
        }
    }
}

/// Bytes the encoder produced since the last drain.
#[derive(Clone, Default)]
struct DrainBuffer(Arc<Mutex<Vec<u8>>>);

impl DrainBuffer {
    fn take(&self) -> CaptureResult<Vec<u8>> {
        let mut bytes = self
            .0
            .lock()
            .map_err(|_| CaptureError::Encoding("gif output buffer poisoned".into()))?;
        Ok(std::mem::take(&mut *bytes))
    }
}

impl Write for DrainBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut bytes = self
            .0
            .lock()
            .map_err(|_| std::io::Error::other("gif output buffer poisoned"))?;
        bytes.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

struct GifSession {
    encoder: GifEncoder<DrainBuffer>,
    drain: DrainBuffer,
    width: u32,
    height: u32,
    /// Each frame's delay is only known once the next one arrives.
    pending: Option<(RgbaImage, Ticks)>,
    last_delay_ms: u32,
    frames: u64,
}

/// Animated GIF recording. Frame delays follow the timestamp deltas.
pub struct GifVideoCodec {
    options: GifVideoOptions,
    gate: SessionGate,
    session: Option<GifSession>,
}

impl Default for GifVideoCodec {
    fn default() -> Self {
        Self::new(GifVideoOptions::default())
    }
}

impl GifVideoCodec {
    pub fn new(options: GifVideoOptions) -> Self {
        Self {
            options,
            gate: SessionGate::default(),
            session: None,
        }
    }

    fn frame_interval_ms(&self) -> u32 {
        (1000 / self.options.frame_rate.max(1)).max(MIN_DELAY_MS)
    }
}

fn delay_ms(previous: Ticks, current: Ticks) -> u32 {
    let ms = current.saturating_sub(previous) / TICKS_PER_MILLISECOND;
    u32::try_from(ms).unwrap_or(u32::MAX).max(MIN_DELAY_MS)
}

fn push_frame(session: &mut GifSession, image: RgbaImage, delay_ms: u32) -> CaptureResult<()> {
    session
        .encoder
        .encode_frame(Frame::from_parts(
            image,
            0,
            0,
            Delay::from_numer_denom_ms(delay_ms, 1),
        ))
        .map_err(|err| CaptureError::Encoding(format!("{CODEC}: {err}")))?;
    session.frames += 1;
    Ok(())
}

impl VideoCodec for GifVideoCodec {
    fn media_type(&self) -> &'static str {
        "image/gif"
    }

    fn file_extension(&self) -> &'static str {
        "gif"
    }

    fn frame_rate(&self) -> u32 {
        self.options.frame_rate
    }

    fn apply_options(&mut self, options: &serde_json::Value) -> CaptureResult<()> {
        self.gate.ensure_configurable(CODEC)?;
        let parsed: GifVideoOptions = parse_options(CODEC, options)?;
        if parsed.frame_rate == 0 || !(1..=30).contains(&parsed.speed) {
            return Err(CaptureError::InvalidConfig(format!(
                "{CODEC} needs frame_rate > 0 and speed in 1..=30"
            )));
        }
        self.options = parsed;
        Ok(())
    }

    fn initialize(
        &mut self,
        width: u32,
        height: u32,
        output: &mut dyn Write,
    ) -> CaptureResult<()> {
        if width == 0 || height == 0 || width > u32::from(u16::MAX) || height > u32::from(u16::MAX)
        {
            return Err(CaptureError::CodecInitialization(format!(
                "{CODEC} cannot encode {width}x{height} frames"
            )));
        }
        self.gate.open(CODEC)?;

        let drain = DrainBuffer::default();
        let mut encoder = GifEncoder::new_with_speed(drain.clone(), self.options.speed);
        let repeat = if self.options.repeat {
            Repeat::Infinite
        } else {
            Repeat::Finite(0)
        };
        encoder
            .set_repeat(repeat)
            .map_err(|err| CaptureError::CodecInitialization(format!("{CODEC}: {err}")))?;
        output.write_all(&drain.take()?)?;

        self.session = Some(GifSession {
            encoder,
            drain,
            width,
            height,
            pending: None,
            last_delay_ms: self.frame_interval_ms(),
            frames: 0,
        });
        Ok(())
    }

    fn encode(
        &mut self,
        bitmap: &BitmapData,
        timestamp: Ticks,
        output: &mut dyn Write,
    ) -> CaptureResult<()> {
        self.gate.admit(CODEC, timestamp)?;
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| CaptureError::InvalidState(format!("{CODEC} session is not open")))?;
        if (bitmap.width(), bitmap.height()) != (session.width, session.height) {
            return Err(CaptureError::Encoding(format!(
                "{CODEC} frame is {}x{}, session is {}x{}",
                bitmap.width(),
                bitmap.height(),
                session.width,
                session.height
            )));
        }

        let image = RgbaImage::from_raw(session.width, session.height, bitmap.to_rgba()?)
            .ok_or(CaptureError::BufferOverflow)?;
        if let Some((previous, previous_ts)) = session.pending.replace((image, timestamp)) {
            let delay = delay_ms(previous_ts, timestamp);
            session.last_delay_ms = delay;
            push_frame(session, previous, delay)?;
        }
        output.write_all(&session.drain.take()?)?;
        Ok(())
    }

    fn finalize(&mut self, output: &mut dyn Write) -> CaptureResult<()> {
        self.gate.close(CODEC)?;
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        if let Some((last, _)) = session.pending.take() {
            let delay = session.last_delay_ms;
            push_frame(&mut session, last, delay)?;
        }
        // An encoder that never saw a frame writes nothing at all.
        if session.frames == 0 {
            return Err(CaptureError::Encoding(format!("{CODEC} received no frames")));
        }
        let GifSession { encoder, drain, .. } = session;
        // Dropping the encoder writes the trailer.
        drop(encoder);
        output.write_all(&drain.take()?)?;
        output.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::{LockToken, PixelFormat};
    use image::AnimationDecoder;
    use image::codecs::gif::GifDecoder;
    use serde_json::json;

    fn solid(width: u32, height: u32, shade: u8) -> CaptureResult<BitmapData> {
        let pixels = [shade, shade, shade, 0xFF].repeat((width * height) as usize);
        BitmapData::new(
            width,
            height,
            PixelFormat::Bgra8,
            width as usize * 4,
            pixels,
            LockToken::new(1),
        )
    }

    #[test]
    fn delays_follow_timestamp_deltas() -> CaptureResult<()> {
        let mut codec = GifVideoCodec::default();
        let mut out = Vec::new();
        codec.initialize(6, 4, &mut out)?;
        codec.encode(&solid(6, 4, 0)?, 0, &mut out)?;
        codec.encode(&solid(6, 4, 80)?, 2_000_000, &mut out)?;
        codec.encode(&solid(6, 4, 160)?, 2_500_000, &mut out)?;
        codec.finalize(&mut out)?;

        let decoder = GifDecoder::new(std::io::Cursor::new(out))
            .map_err(|err| CaptureError::Encoding(err.to_string()))?;
        let frames = decoder
            .into_frames()
            .collect_frames()
            .map_err(|err| CaptureError::Encoding(err.to_string()))?;
        let delays: Vec<u32> = frames
            .iter()
            .map(|frame| {
                let (numer, denom) = frame.delay().numer_denom_ms();
                numer / denom
            })
            .collect();
        assert_eq!(delays, vec![200, 50, 50]);
        Ok(())
    }

    #[test]
    fn options_are_rejected_once_initialized() -> CaptureResult<()> {
        let mut codec = GifVideoCodec::default();
        codec.apply_options(&json!({ "frame_rate": 5 }))?;
        assert_eq!(codec.frame_rate(), 5);

        codec.initialize(2, 2, &mut Vec::new())?;
        assert!(matches!(
            codec.apply_options(&json!({ "frame_rate": 30 })),
            Err(CaptureError::InvalidState(_))
        ));
        assert_eq!(codec.frame_rate(), 5);
        Ok(())
    }

    #[test]
    fn encode_requires_open_session_and_fixed_size() -> CaptureResult<()> {
        let mut codec = GifVideoCodec::default();
        let mut out = Vec::new();
        assert!(codec.encode(&solid(2, 2, 1)?, 1, &mut out).is_err());
        codec.initialize(2, 2, &mut out)?;
        assert!(matches!(
            codec.encode(&solid(3, 2, 1)?, 1, &mut out),
            Err(CaptureError::Encoding(_))
        ));
        codec.encode(&solid(2, 2, 1)?, 2, &mut out)?;
        codec.finalize(&mut out)?;
        assert!(codec.finalize(&mut out).is_err());
        Ok(())
    }

    #[test]
    fn finalize_without_frames_is_an_error() -> CaptureResult<()> {
        let mut codec = GifVideoCodec::default();
        let mut out = Vec::new();
        codec.initialize(4, 4, &mut out)?;
        assert!(matches!(
            codec.finalize(&mut out),
            Err(CaptureError::Encoding(_))
        ));
        assert!(codec.finalize(&mut out).is_err());
        Ok(())
    }
}
