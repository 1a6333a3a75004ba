#![forbid(unsafe_code)]

//! Layered run configuration. Each setting is taken from the first layer that
//! provides it: command-line flags, then `MEDIAGRAB_*` environment variables,
//! then the TOML config file, then built-in defaults.

use crate::engine::DEFAULT_YTDLP_BINARY;
use crate::job::{AudioCodec, DownloadOptions, MediaKind, Quality, RetryPolicy, VideoContainer};
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::{
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_CONFIG_FILE: &str = "mediagrab.toml";
pub const DEFAULT_JOBS: usize = 1;

pub const ENV_CONFIG: &str = "MEDIAGRAB_CONFIG";
pub const ENV_OUTPUT: &str = "MEDIAGRAB_OUTPUT";
pub const ENV_ARCHIVE: &str = "MEDIAGRAB_ARCHIVE";
pub const ENV_PROXY: &str = "MEDIAGRAB_PROXY";
pub const ENV_YTDLP: &str = "MEDIAGRAB_YTDLP";
pub const ENV_JOBS: &str = "MEDIAGRAB_JOBS";

/// What the exit status says about failed jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExitPolicy {
    /// Failures only show up in the summary; the run exits 0.
    #[default]
    ReportOnly,
    /// Any failed job turns the exit status into 2.
    FailOnError,
}

/// One layer of settings. The config file deserializes straight into it and
/// the CLI and environment fill in the same shape.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigLayer {
    pub output: Option<PathBuf>,
    pub quality: Option<String>,
    pub audio: Option<bool>,
    pub audio_format: Option<AudioCodec>,
    pub video_format: Option<VideoContainer>,
    pub subtitles: Option<bool>,
    pub embed_subs: Option<bool>,
    pub sub_langs: Option<Vec<String>>,
    pub write_thumbnail: Option<bool>,
    pub embed_thumbnail: Option<bool>,
    pub cookies_from_browser: Option<String>,
    pub proxy: Option<String>,
    pub rate_limit: Option<String>,
    pub concurrent_fragments: Option<u32>,
    pub sponsorblock_remove: Option<Vec<String>>,
    pub archive: Option<PathBuf>,
    pub filename_template: Option<String>,
    pub retries: Option<u32>,
    pub fragment_retries: Option<u32>,
    pub skip_unavailable_fragments: Option<bool>,
    pub jobs: Option<usize>,
    pub probe: Option<bool>,
    pub ytdlp_path: Option<PathBuf>,
    pub summary_json: Option<PathBuf>,
    pub exit_policy: Option<ExitPolicy>,
}

impl ConfigLayer {
    /// Fills every unset field of `self` from `lower`.
    pub fn or(self, lower: ConfigLayer) -> ConfigLayer {
        ConfigLayer {
            output: self.output.or(lower.output),
            quality: self.quality.or(lower.quality),
            audio: self.audio.or(lower.audio),
            audio_format: self.audio_format.or(lower.audio_format),
            video_format: self.video_format.or(lower.video_format),
            subtitles: self.subtitles.or(lower.subtitles),
            embed_subs: self.embed_subs.or(lower.embed_subs),
            sub_langs: self.sub_langs.or(lower.sub_langs),
            write_thumbnail: self.write_thumbnail.or(lower.write_thumbnail),
            embed_thumbnail: self.embed_thumbnail.or(lower.embed_thumbnail),
            cookies_from_browser: self.cookies_from_browser.or(lower.cookies_from_browser),
            proxy: self.proxy.or(lower.proxy),
            rate_limit: self.rate_limit.or(lower.rate_limit),
            concurrent_fragments: self.concurrent_fragments.or(lower.concurrent_fragments),
            sponsorblock_remove: self.sponsorblock_remove.or(lower.sponsorblock_remove),
            archive: self.archive.or(lower.archive),
            filename_template: self.filename_template.or(lower.filename_template),
            retries: self.retries.or(lower.retries),
            fragment_retries: self.fragment_retries.or(lower.fragment_retries),
            skip_unavailable_fragments: self
                .skip_unavailable_fragments
                .or(lower.skip_unavailable_fragments),
            jobs: self.jobs.or(lower.jobs),
            probe: self.probe.or(lower.probe),
            ytdlp_path: self.ytdlp_path.or(lower.ytdlp_path),
            summary_json: self.summary_json.or(lower.summary_json),
            exit_policy: self.exit_policy.or(lower.exit_policy),
        }
    }
}

/// Fully resolved settings for one run.
#[derive(Debug, Clone)]
pub struct Settings {
    pub download: DownloadOptions,
    pub ytdlp_path: PathBuf,
    pub jobs: usize,
    pub probe: bool,
    pub summary_json: Option<PathBuf>,
    pub exit_policy: ExitPolicy,
    /// Config file that contributed to these settings, if any.
    pub config_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub config_path: Option<PathBuf>,
    pub cli: ConfigLayer,
}

pub fn resolve_settings(overrides: RuntimeOverrides) -> Result<Settings> {
    resolve_settings_with(overrides, env_var_string, Path::new("."))
}

/// Resolution with the environment and working directory injected, so tests
/// never depend on the real process state.
fn resolve_settings_with(
    overrides: RuntimeOverrides,
    env_lookup: impl Fn(&str) -> Option<String>,
    working_dir: &Path,
) -> Result<Settings> {
    let (file_layer, config_file) =
        match locate_config_file(overrides.config_path, &env_lookup, working_dir) {
            Some(path) => (read_config_file(&path)?, Some(path)),
            None => (ConfigLayer::default(), None),
        };
    let env_layer = env_layer(&env_lookup)?;
    let merged = overrides.cli.or(env_layer).or(file_layer);
    build_settings(merged, config_file)
}

fn locate_config_file(
    explicit: Option<PathBuf>,
    env_lookup: &impl Fn(&str) -> Option<String>,
    working_dir: &Path,
) -> Option<PathBuf> {
    explicit
        .or_else(|| env_lookup(ENV_CONFIG).map(PathBuf::from))
        .or_else(|| {
            let candidate = working_dir.join(DEFAULT_CONFIG_FILE);
            candidate.is_file().then_some(candidate)
        })
}

pub fn read_config_file(path: &Path) -> Result<ConfigLayer> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("Parsing {}", path.display()))
}

fn env_layer(env_lookup: &impl Fn(&str) -> Option<String>) -> Result<ConfigLayer> {
    let jobs = env_lookup(ENV_JOBS)
        .map(|value| {
            value
                .parse::<usize>()
                .with_context(|| format!("{ENV_JOBS}={value:?} is not a number"))
        })
        .transpose()?;
    Ok(ConfigLayer {
        output: env_lookup(ENV_OUTPUT).map(PathBuf::from),
        archive: env_lookup(ENV_ARCHIVE).map(PathBuf::from),
        proxy: env_lookup(ENV_PROXY),
        ytdlp_path: env_lookup(ENV_YTDLP).map(PathBuf::from),
        jobs,
        ..ConfigLayer::default()
    })
}

fn build_settings(layer: ConfigLayer, config_file: Option<PathBuf>) -> Result<Settings> {
    let defaults = DownloadOptions::default();
    let quality = match layer.quality.as_deref() {
        Some(raw) => raw.parse::<Quality>().context("Invalid quality setting")?,
        None => defaults.quality,
    };
    let jobs = layer.jobs.unwrap_or(DEFAULT_JOBS);
    if jobs == 0 {
        return Err(anyhow!("jobs must be at least 1"));
    }

    let download = DownloadOptions {
        output_dir: layer.output.unwrap_or(defaults.output_dir),
        quality,
        media_kind: if layer.audio.unwrap_or(false) {
            MediaKind::Audio
        } else {
            MediaKind::Video
        },
        audio_codec: layer.audio_format.unwrap_or(defaults.audio_codec),
        container: layer.video_format.unwrap_or(defaults.container),
        write_subtitles: layer.subtitles.unwrap_or(false),
        embed_subtitles: layer.embed_subs.unwrap_or(false),
        // Lists pass through as given so that an explicitly empty list is
        // rejected by validation instead of silently replaced.
        subtitle_langs: layer.sub_langs.unwrap_or(defaults.subtitle_langs),
        write_thumbnail: layer.write_thumbnail.unwrap_or(false),
        embed_thumbnail: layer.embed_thumbnail.unwrap_or(false),
        sponsorblock_remove: layer.sponsorblock_remove.unwrap_or_default(),
        output_template: non_blank(layer.filename_template),
        archive_path: layer.archive,
        rate_limit: non_blank(layer.rate_limit),
        proxy: non_blank(layer.proxy),
        concurrent_fragments: layer.concurrent_fragments,
        cookies_from_browser: non_blank(layer.cookies_from_browser),
        retry: RetryPolicy {
            max_retries: layer.retries.unwrap_or(defaults.retry.max_retries),
            max_fragment_retries: layer
                .fragment_retries
                .unwrap_or(defaults.retry.max_fragment_retries),
            skip_unavailable_fragments: layer
                .skip_unavailable_fragments
                .unwrap_or(defaults.retry.skip_unavailable_fragments),
        },
    };

    Ok(Settings {
        download,
        ytdlp_path: layer
            .ytdlp_path
            .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP_BINARY)),
        jobs,
        probe: layer.probe.unwrap_or(true),
        summary_json: layer.summary_json,
        exit_policy: layer.exit_policy.unwrap_or_default(),
        config_file,
    })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::{NamedTempFile, tempdir};

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    fn resolve(overrides: RuntimeOverrides, env: &[(&str, &str)]) -> Result<Settings> {
        let empty = tempdir().unwrap();
        resolve_settings_with(overrides, env_from(env), empty.path())
    }

    #[test]
    fn defaults_without_any_layer() {
        let settings = resolve(RuntimeOverrides::default(), &[]).unwrap();
        assert_eq!(settings.download.output_dir, PathBuf::from("downloads"));
        assert_eq!(settings.download.quality, Quality::Best);
        assert_eq!(settings.download.media_kind, MediaKind::Video);
        assert_eq!(settings.download.subtitle_langs, vec!["en".to_string()]);
        assert_eq!(settings.download.retry, RetryPolicy::default());
        assert_eq!(settings.ytdlp_path, PathBuf::from(DEFAULT_YTDLP_BINARY));
        assert_eq!(settings.jobs, DEFAULT_JOBS);
        assert!(settings.probe);
        assert_eq!(settings.exit_policy, ExitPolicy::ReportOnly);
        assert!(settings.config_file.is_none());
    }

    #[test]
    fn config_file_populates_settings() {
        let cfg = make_config(
            r#"
            output = "/media/grab"
            quality = "720p"
            audio = true
            audio_format = "opus"
            sub_langs = ["en", "de"]
            sponsorblock_remove = ["sponsor", "intro"]
            retries = 3
            jobs = 2
            exit_policy = "fail-on-error"
            "#,
        );
        let settings = resolve(
            RuntimeOverrides {
                config_path: Some(cfg.path().to_path_buf()),
                ..RuntimeOverrides::default()
            },
            &[],
        )
        .unwrap();
        assert_eq!(settings.download.output_dir, PathBuf::from("/media/grab"));
        assert_eq!(settings.download.quality, Quality::MaxHeight(720));
        assert_eq!(settings.download.media_kind, MediaKind::Audio);
        assert_eq!(settings.download.audio_codec, AudioCodec::Opus);
        assert_eq!(settings.download.subtitle_langs, vec!["en", "de"]);
        assert_eq!(settings.download.sponsorblock_remove, vec!["sponsor", "intro"]);
        assert_eq!(settings.download.retry.max_retries, 3);
        assert_eq!(settings.download.retry.max_fragment_retries, 10);
        assert_eq!(settings.jobs, 2);
        assert_eq!(settings.exit_policy, ExitPolicy::FailOnError);
        assert_eq!(settings.config_file.as_deref(), Some(cfg.path()));
    }

    #[test]
    fn precedence_is_cli_then_env_then_file() {
        let cfg = make_config(
            "output = \"/file\"\nproxy = \"http://file:1\"\narchive = \"file.txt\"\njobs = 4\n",
        );
        let overrides = RuntimeOverrides {
            config_path: Some(cfg.path().to_path_buf()),
            cli: ConfigLayer {
                output: Some(PathBuf::from("/cli")),
                ..ConfigLayer::default()
            },
        };
        let settings = resolve(
            overrides,
            &[
                (ENV_OUTPUT, "/env"),
                (ENV_PROXY, "http://env:2"),
                (ENV_YTDLP, "/opt/yt-dlp"),
            ],
        )
        .unwrap();
        assert_eq!(settings.download.output_dir, PathBuf::from("/cli"));
        assert_eq!(settings.download.proxy.as_deref(), Some("http://env:2"));
        assert_eq!(settings.download.archive_path, Some(PathBuf::from("file.txt")));
        assert_eq!(settings.ytdlp_path, PathBuf::from("/opt/yt-dlp"));
        assert_eq!(settings.jobs, 4);
    }

    #[test]
    fn env_selects_config_file_and_default_file_is_picked_up() {
        let cfg = make_config("quality = \"worst\"\n");
        let settings = resolve(
            RuntimeOverrides::default(),
            &[(ENV_CONFIG, cfg.path().to_str().unwrap())],
        )
        .unwrap();
        assert_eq!(settings.download.quality, Quality::Worst);

        let dir = tempdir().unwrap();
        fs::write(dir.path().join(DEFAULT_CONFIG_FILE), "probe = false\n").unwrap();
        let settings =
            resolve_settings_with(RuntimeOverrides::default(), |_| None, dir.path()).unwrap();
        assert!(!settings.probe);
        assert_eq!(
            settings.config_file,
            Some(dir.path().join(DEFAULT_CONFIG_FILE))
        );
    }

    #[test]
    fn explicit_missing_config_file_is_an_error() {
        let dir = tempdir().unwrap();
        let err = resolve(
            RuntimeOverrides {
                config_path: Some(dir.path().join("nope.toml")),
                ..RuntimeOverrides::default()
            },
            &[],
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("nope.toml"));
    }

    #[test]
    fn unknown_keys_and_bad_values_are_rejected() {
        let typo = make_config("qualty = \"best\"\n");
        assert!(read_config_file(typo.path()).is_err());

        let bad_codec = make_config("audio_format = \"flac\"\n");
        assert!(read_config_file(bad_codec.path()).is_err());

        let bad_quality = make_config("quality = \"huge\"\n");
        let err = resolve(
            RuntimeOverrides {
                config_path: Some(bad_quality.path().to_path_buf()),
                ..RuntimeOverrides::default()
            },
            &[],
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("quality"));
    }

    #[test]
    fn invalid_jobs_are_rejected() {
        assert!(resolve(RuntimeOverrides::default(), &[(ENV_JOBS, "many")]).is_err());
        let zero = RuntimeOverrides {
            cli: ConfigLayer {
                jobs: Some(0),
                ..ConfigLayer::default()
            },
            ..RuntimeOverrides::default()
        };
        assert!(resolve(zero, &[]).is_err());
    }

    #[test]
    fn blank_scalars_fall_back_to_defaults() {
        let overrides = RuntimeOverrides {
            cli: ConfigLayer {
                proxy: Some("   ".into()),
                filename_template: Some(String::new()),
                ..ConfigLayer::default()
            },
            ..RuntimeOverrides::default()
        };
        let settings = resolve(overrides, &[]).unwrap();
        assert!(settings.download.proxy.is_none());
        assert!(settings.download.output_template.is_none());
    }

    fn resolve_lists(sub_langs: &str, sponsorblock: &str) -> Settings {
        let overrides = RuntimeOverrides {
            cli: ConfigLayer {
                subtitles: Some(true),
                sub_langs: Some(vec![sub_langs.into()]),
                sponsorblock_remove: Some(vec![sponsorblock.into()]),
                ..ConfigLayer::default()
            },
            ..RuntimeOverrides::default()
        };
        resolve(overrides, &[]).unwrap()
    }

    #[test]
    fn empty_lists_reach_validation() {
        let settings = resolve_lists(",", "sponsor");
        assert_eq!(settings.download.subtitle_langs, vec![","]);
        let err = settings.download.validate().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
        assert!(err.to_string().contains("subtitle languages"));

        let settings = resolve_lists("en", " , ");
        let err = settings.download.validate().unwrap_err();
        assert!(err.to_string().contains("sponsorblock"));
    }

    #[test]
    fn comma_separated_lists_split_into_steps() {
        use crate::job::{JobDescriptor, PostProcessStep};

        let settings = resolve_lists("en, fr", "sponsor,selfpromo");
        let job = JobDescriptor::build("https://example.com/v", &settings.download).unwrap();
        assert!(job.has_step(&PostProcessStep::SponsorBlockRemove(vec![
            "sponsor".into(),
            "selfpromo".into()
        ])));
        assert!(job.has_step(&PostProcessStep::WriteSubtitles(vec![
            "en".into(),
            "fr".into()
        ])));
    }
}
