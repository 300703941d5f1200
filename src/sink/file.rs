use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{Datelike, NaiveDateTime, Timelike};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ActionSink, SinkContext, SinkOutcome};
use crate::bitmap::Thumbnail;
use crate::codec::{MediaKind, parse_options};
use crate::error::{CaptureError, CaptureResult};

const NAME: &str = "file";
pub const DEFAULT_TEMPLATE: &str = "{Type} {Year}-{Month}-{Day} {Hour}.{Minute}.{Second}.{Extension}";

fn default_template() -> String {
    DEFAULT_TEMPLATE.to_string()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileSinkOptions {
    /// Base directory. Pictures (stills) or Videos (recordings) when unset.
    pub directory: Option<PathBuf>,
    /// Relative path with `{Variable}` placeholders. May contain
    /// subdirectories.
    #[serde(default = "default_template")]
    pub template: String,
    pub overwrite: bool,
}

impl Default for FileSinkOptions {
    fn default() -> Self {
        Self {
            directory: None,
            template: default_template(),
            overwrite: false,
        }
    }
}

/// Substitute the capture's timestamp, extension and kind into `template`.
/// Unknown placeholders are left as written.
pub fn render_file_name(
    template: &str,
    captured_at: &NaiveDateTime,
    extension: &str,
    media: MediaKind,
) -> String {
    let kind = match media {
        MediaKind::StillImage => "Screenshot",
        MediaKind::Video => "Recording",
    };
    let year = captured_at.year();
    let substitutions = [
        ("{Year}", year.to_string()),
        ("{ShortYear}", format!("{:02}", year.rem_euclid(100))),
        ("{Month}", format!("{:02}", captured_at.month())),
        ("{Day}", format!("{:02}", captured_at.day())),
        ("{Hour}", format!("{:02}", captured_at.hour())),
        ("{Minute}", format!("{:02}", captured_at.minute())),
        ("{Second}", format!("{:02}", captured_at.second())),
        ("{Extension}", extension.to_string()),
        ("{Type}", kind.to_string()),
    ];
    substitutions
        .iter()
        .fold(template.to_string(), |name, (key, value)| name.replace(key, value))
}

fn default_directory(media: MediaKind) -> PathBuf {
    let user_dir = UserDirs::new().and_then(|dirs| match media {
        MediaKind::StillImage => dirs.picture_dir().map(Path::to_path_buf),
        MediaKind::Video => dirs.video_dir().map(Path::to_path_buf),
    });
    user_dir.unwrap_or_else(std::env::temp_dir)
}

fn file_uri(path: &Path) -> String {
    let text = path.to_string_lossy().replace('\\', "/");
    if text.starts_with('/') {
        format!("file://{text}")
    } else {
        format!("file:///{text}")
    }
}

/// Writes the encoded capture to a file named from a template.
pub struct FileSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    thumbnail: Option<Thumbnail>,
}

impl FileSink {
    /// Render the path and create the file. The parent directories are
    /// created as needed.
    pub fn create(context: &SinkContext, options: &FileSinkOptions) -> CaptureResult<Self> {
        let relative = render_file_name(
            &options.template,
            &context.captured_at,
            context.file_extension,
            context.media,
        );
        if relative.trim().is_empty() {
            return Err(CaptureError::InvalidConfig(
                "file name template renders to an empty name".into(),
            ));
        }
        let base = options
            .directory
            .clone()
            .unwrap_or_else(|| default_directory(context.media));
        let path = base.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut open = OpenOptions::new();
        open.write(true);
        if options.overwrite {
            open.create(true).truncate(true);
        } else {
            open.create_new(true);
        }
        let file = open.open(&path).map_err(|err| {
            CaptureError::sink(NAME, format!("cannot create {}: {err}", path.display()))
        })?;
        debug!(path = %path.display(), "file sink opened");
        Ok(Self {
            path,
            writer: Some(BufWriter::new(file)),
            thumbnail: context.thumbnail.clone(),
        })
    }

    pub fn from_options(context: &SinkContext, options: &serde_json::Value) -> CaptureResult<Self> {
        let options: FileSinkOptions = parse_options(NAME, options)?;
        Self::create(context, &options)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn writer(&mut self) -> CaptureResult<&mut BufWriter<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| CaptureError::sink(NAME, "file already closed"))
    }
}

impl ActionSink for FileSink {
    fn name(&self) -> &str {
        NAME
    }

    fn supports_pause(&self) -> bool {
        true
    }

    fn write(&mut self, bytes: &[u8]) -> CaptureResult<()> {
        self.writer()?.write_all(bytes)?;
        Ok(())
    }

    fn commit(&mut self) -> CaptureResult<SinkOutcome> {
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| CaptureError::sink(NAME, "file already closed"))?;
        writer.flush()?;
        Ok(SinkOutcome {
            uri: Some(file_uri(&self.path)),
            thumbnail: self.thumbnail.take(),
        })
    }

    fn abort(&mut self) {
        if self.writer.take().is_some() {
            if let Err(err) = std::fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %err, "partial file left behind");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 7)
            .and_then(|date| date.and_hms_opt(9, 5, 2))
            .unwrap_or_default()
    }

    fn scratch_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("captain-file-sink-{tag}-{}", std::process::id()))
    }

    fn context(media: MediaKind) -> SinkContext {
        let mut context = SinkContext::new(media, "image/png", "png");
        context.captured_at = at();
        context
    }

    #[test]
    fn template_variables_are_substituted() {
        assert_eq!(
            render_file_name(DEFAULT_TEMPLATE, &at(), "png", MediaKind::StillImage),
            "Screenshot 2024-03-07 09.05.02.png"
        );
        assert_eq!(
            render_file_name("{ShortYear}/{Type}-{Nope}.{Extension}", &at(), "mp4", MediaKind::Video),
            "24/Recording-{Nope}.mp4"
        );
    }

    #[test]
    fn writes_commit_to_templated_path() -> CaptureResult<()> {
        let dir = scratch_dir("commit");
        let options = FileSinkOptions {
            directory: Some(dir.clone()),
            template: "nested/{Year}.{Extension}".into(),
            overwrite: true,
        };
        let mut sink = FileSink::create(&context(MediaKind::StillImage), &options)?;
        sink.write(b"\x89PNG")?;
        sink.write(b"rest")?;
        let outcome = sink.commit()?;

        let path = dir.join("nested").join("2024.png");
        assert_eq!(std::fs::read(&path)?, b"\x89PNGrest");
        assert!(outcome.uri.is_some_and(|uri| uri.starts_with("file://") && uri.ends_with("2024.png")));
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn existing_file_is_not_clobbered() -> CaptureResult<()> {
        let dir = scratch_dir("clobber");
        let options = FileSinkOptions {
            directory: Some(dir.clone()),
            template: "same.{Extension}".into(),
            overwrite: false,
        };
        let mut first = FileSink::create(&context(MediaKind::StillImage), &options)?;
        first.commit()?;
        assert!(FileSink::create(&context(MediaKind::StillImage), &options).is_err());
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn abort_removes_partial_file() -> CaptureResult<()> {
        let dir = scratch_dir("abort");
        let options = FileSinkOptions {
            directory: Some(dir.clone()),
            template: "partial.{Extension}".into(),
            overwrite: true,
        };
        let mut sink = FileSink::create(&context(MediaKind::Video), &options)?;
        sink.write(b"half")?;
        let path = sink.path().to_path_buf();
        sink.abort();
        assert!(!path.exists());
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn unknown_options_are_rejected() {
        let err = FileSink::from_options(
            &context(MediaKind::StillImage),
            &serde_json::json!({ "folder": "x" }),
        );
        assert!(matches!(err, Err(CaptureError::InvalidConfig(_))));
    }
}
