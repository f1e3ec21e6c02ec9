//! Command line options.

use std::path::PathBuf;

use anyhow::{anyhow, bail, Context};
use prism::ApiType;

const DEFAULT_WIDTH: u32 = 1280;
const DEFAULT_HEIGHT: u32 = 720;
/// Frames rendered by the headless software run when `--frames` is absent.
pub const DEFAULT_HEADLESS_FRAMES: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    pub backend: ApiType,
    /// Exit after this many presented frames. `None` runs until the window
    /// is closed.
    pub frames: Option<u64>,
    /// Swapchain back buffers.
    pub frame_count: u32,
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
    pub shader_dir: Option<PathBuf>,
    pub help: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            backend: ApiType::Vulkan,
            frames: None,
            frame_count: 3,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            vsync: true,
            shader_dir: None,
            help: false,
        }
    }
}

impl Options {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::parse(std::env::args().skip(1))
    }

    /// Parse arguments, program name excluded.
    pub fn parse(args: impl IntoIterator<Item = String>) -> anyhow::Result<Self> {
        let mut options = Self::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-h" | "--help" => options.help = true,
                "--no-vsync" => options.vsync = false,
                "--backend" => {
                    options.backend = value(&arg, args.next())?.parse().map_err(|e| anyhow!("{e}"))?;
                }
                "--frames" => options.frames = Some(number(&arg, args.next())?),
                "--frame-count" => options.frame_count = number(&arg, args.next())?,
                "--width" => options.width = number(&arg, args.next())?,
                "--height" => options.height = number(&arg, args.next())?,
                "--shader-dir" => options.shader_dir = Some(PathBuf::from(value(&arg, args.next())?)),
                other => bail!("unknown argument '{other}' (see --help)"),
            }
        }

        if options.width == 0 || options.height == 0 {
            bail!("window size must be non-zero, got {}x{}", options.width, options.height);
        }
        if options.frame_count < 2 {
            bail!("--frame-count must be at least 2");
        }
        Ok(options)
    }

    /// Frames to render when no window can be closed to stop the run.
    pub fn headless_frames(&self) -> u64 {
        self.frames.unwrap_or(DEFAULT_HEADLESS_FRAMES)
    }
}

fn value(flag: &str, next: Option<String>) -> anyhow::Result<String> {
    next.with_context(|| format!("{flag} expects a value"))
}

fn number<T>(flag: &str, next: Option<String>) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = value(flag, next)?;
    raw.parse()
        .with_context(|| format!("{flag} expects a number, got '{raw}'"))
}

pub fn print_help() {
    eprintln!(
        "Prism triangle

USAGE:
    cargo run -p prism-triangle -- [OPTIONS]

OPTIONS:
    --backend <NAME>     software or vulkan (default: vulkan)
    --frames <N>         Exit after N presented frames
                         Default: until the window closes, {DEFAULT_HEADLESS_FRAMES} for software
    --frame-count <N>    Swapchain back buffers (default: 3)
    --width <PX>         Window width (default: {DEFAULT_WIDTH})
    --height <PX>        Window height (default: {DEFAULT_HEIGHT})
    --no-vsync           Present without waiting for vertical blank
    --shader-dir <DIR>   Directory holding triangle.vert.spv and triangle.frag.spv
    -h, --help           Print this help message

ENVIRONMENT VARIABLES:
    PRISM_SHADER_DIR     Shader directory used when --shader-dir is absent
    RUST_LOG             Set log level (e.g., info, debug, trace)"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<Options> {
        Options::parse(args.iter().map(ToString::to_string))
    }

    #[test]
    fn defaults() {
        let options = parse(&[]).unwrap();
        assert_eq!(options, Options::default());
        assert_eq!(options.headless_frames(), DEFAULT_HEADLESS_FRAMES);
    }

    #[test]
    fn every_flag() {
        let options = parse(&[
            "--backend",
            "software",
            "--frames",
            "12",
            "--frame-count",
            "2",
            "--width",
            "64",
            "--height",
            "32",
            "--no-vsync",
            "--shader-dir",
            "/tmp/spv",
        ])
        .unwrap();
        assert_eq!(options.backend, ApiType::Software);
        assert_eq!(options.frames, Some(12));
        assert_eq!(options.frame_count, 2);
        assert_eq!((options.width, options.height), (64, 32));
        assert!(!options.vsync);
        assert_eq!(options.shader_dir, Some(PathBuf::from("/tmp/spv")));
    }

    #[test]
    fn bad_input_is_reported() {
        assert!(parse(&["--backend", "metal"]).is_err());
        assert!(parse(&["--frames"]).is_err());
        assert!(parse(&["--width", "wide"]).is_err());
        assert!(parse(&["--width", "0"]).is_err());
        assert!(parse(&["--frame-count", "1"]).is_err());
        assert!(parse(&["--fullscreen"]).is_err());
    }

    #[test]
    fn help_keeps_parsing() {
        let options = parse(&["-h", "--no-vsync"]).unwrap();
        assert!(options.help);
        assert!(!options.vsync);
    }
}
