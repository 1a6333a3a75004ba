#![forbid(unsafe_code)]

//! Prompt-driven front end used when no URL or batch file is given.

use crate::console::Console;
use crate::job::{AudioCodec, DownloadOptions, MediaKind, Quality};
use anyhow::{Context, Result, anyhow, bail};
use std::io::BufRead;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuChoice {
    BestVideo,
    VideoAtQuality(Quality),
    AudioOnly(AudioCodec),
}

impl MenuChoice {
    pub fn apply(self, options: &mut DownloadOptions) {
        match self {
            Self::BestVideo => {
                options.media_kind = MediaKind::Video;
                options.quality = Quality::Best;
            }
            Self::VideoAtQuality(quality) => {
                options.media_kind = MediaKind::Video;
                options.quality = quality;
            }
            Self::AudioOnly(codec) => {
                options.media_kind = MediaKind::Audio;
                options.audio_codec = codec;
            }
        }
    }
}

pub struct InteractiveSession<R> {
    input: R,
    console: Console,
}

impl<R: BufRead> InteractiveSession<R> {
    pub fn new(input: R, console: Console) -> Self {
        Self { input, console }
    }

    pub fn banner(&self) {
        self.console.line("Video Downloader - Interactive Mode");
        self.console.blank();
    }

    pub fn ask_url(&mut self) -> Result<String> {
        let url = self.ask("Enter video URL: ")?;
        if url.is_empty() {
            bail!("no URL entered");
        }
        Ok(url)
    }

    pub fn ask_choice(&mut self) -> Result<MenuChoice> {
        self.console.blank();
        self.console.line("Download options:");
        self.console.line("1. Video (best quality)");
        self.console.line("2. Video (specific quality)");
        self.console.line("3. Audio only");
        self.console.blank();

        match self.ask("Select option (1-3): ")?.as_str() {
            "1" => Ok(MenuChoice::BestVideo),
            "2" => {
                let raw = self.ask("Enter quality (720p, 1080p, etc.): ")?;
                let quality = raw
                    .parse::<Quality>()
                    .with_context(|| format!("Invalid quality {raw:?}"))?;
                Ok(MenuChoice::VideoAtQuality(quality))
            }
            "3" => {
                let raw = self.ask("Enter audio format (mp3, m4a, etc.) [default: mp3]: ")?;
                let codec = if raw.is_empty() {
                    AudioCodec::Mp3
                } else {
                    raw.parse::<AudioCodec>()
                        .with_context(|| format!("Invalid audio format {raw:?}"))?
                };
                Ok(MenuChoice::AudioOnly(codec))
            }
            other => {
                self.console.line("Invalid choice");
                Err(anyhow!("invalid menu choice {other:?}"))
            }
        }
    }

    fn ask(&mut self, prompt: &str) -> Result<String> {
        self.console.prompt(prompt);
        let mut line = String::new();
        let read = self
            .input
            .read_line(&mut line)
            .context("Reading from stdin")?;
        if read == 0 {
            bail!("input closed before an answer was given");
        }
        Ok(line.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn session_from(input: &str) -> (InteractiveSession<Cursor<Vec<u8>>>, crate::console::CapturedOutput) {
        let (console, output) = Console::capture();
        (
            InteractiveSession::new(Cursor::new(input.as_bytes().to_vec()), console),
            output,
        )
    }

    #[test]
    fn best_video_flow() {
        let (mut session, output) = session_from("https://example.com/v\n1\n");
        session.banner();
        assert_eq!(session.ask_url().unwrap(), "https://example.com/v");
        assert_eq!(session.ask_choice().unwrap(), MenuChoice::BestVideo);
        let text = output.contents();
        assert!(text.contains("3. Audio only"));
        assert!(text.contains("Select option (1-3): "));
    }

    #[test]
    fn specific_quality_and_audio_default() {
        let (mut session, _) = session_from("2\n720p\n");
        assert_eq!(
            session.ask_choice().unwrap(),
            MenuChoice::VideoAtQuality(Quality::MaxHeight(720))
        );

        let (mut session, _) = session_from("3\n\n");
        let choice = session.ask_choice().unwrap();
        assert_eq!(choice, MenuChoice::AudioOnly(AudioCodec::Mp3));

        let mut options = DownloadOptions::default();
        choice.apply(&mut options);
        assert_eq!(options.media_kind, MediaKind::Audio);
        assert_eq!(options.audio_codec, AudioCodec::Mp3);
    }

    #[test]
    fn invalid_answers_are_errors() {
        let (mut session, output) = session_from("7\n");
        assert!(session.ask_choice().is_err());
        assert!(output.contents().contains("Invalid choice"));

        let (mut session, _) = session_from("3\nflac\n");
        assert!(session.ask_choice().is_err());

        let (mut session, _) = session_from("");
        assert!(session.ask_url().is_err());

        let (mut session, _) = session_from("\n");
        assert!(session.ask_url().is_err());
    }
}
