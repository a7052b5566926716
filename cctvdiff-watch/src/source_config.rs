//! # Typed per-source configuration
//!
//! String keys are resolved once per reconfiguration into [`SourceConfig`], so the polling loop
//! never touches the key/value store on its hot path.

use crate::settings::KeyValueStore;
use cctvdiff::prelude::v1::*;
use log::*;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Nesting limit of `{key}` references.
const MAX_SUBSTITUTION_DEPTH: usize = 8;

pub const DEFAULT_FILENAME: &str = "%Y-%m-%d/%H/{index}/Image-{seqno}-%Y-%m-%d-%H-%M-%S-%3f";
pub const DEFAULT_DET_FILENAME: &str =
    "%Y-%m-%d/%H/{index}/detection/Image-{seqno}-%Y-%m-%d-%H-%M-%S-%3f";

/// How a source obtains its images.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CaptureMethod {
    /// Shell command writing a single image to `{file}`.
    Command(String),
    /// Pre-populated directory, consumed oldest first.
    Directory(PathBuf),
    None,
}

/// Shell command templates run on detection transitions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ActionTemplates {
    pub detection_start: Option<String>,
    pub detection: Option<String>,
    pub detection_end: Option<String>,
    pub no_detection: Option<String>,
}

/// Process wide settings. Read once at startup.
#[derive(Clone, Debug, PartialEq)]
pub struct GlobalConfig {
    pub sources: usize,
    pub log_location: Option<PathBuf>,
    pub stats_interval: Duration,
}

impl GlobalConfig {
    pub fn resolve(store: &KeyValueStore) -> Self {
        let r = Resolver::new(store, 0);
        Self {
            sources: r.integer("sources", 1) as usize,
            log_location: r.string("loglocation").map(PathBuf::from),
            stats_interval: r.duration("statsinterval", 2.0),
        }
    }
}

/// Every tunable of a single source.
#[derive(Clone, Debug)]
pub struct SourceConfig {
    pub index: usize,
    pub name: String,

    pub capture: CaptureMethod,
    pub temp_file: PathBuf,
    pub capture_timeout: Duration,
    pub period: Duration,
    pub subsample: u64,

    pub image_dir: PathBuf,
    pub filename: String,
    pub det_image_dir: Option<PathBuf>,
    pub det_filename: String,
    pub det_log: Option<String>,
    pub jpeg_quality: u8,

    pub difference: DifferenceSettings,
    pub kernel: Option<ConvolutionKernel>,
    pub gain_image: Option<PathBuf>,
    pub mask_image: Option<PathBuf>,

    pub coefficients: BaselineCoefficients,
    pub avg_factor: f64,
    pub sd_factor: f64,

    pub detection: DetectionSettings,
    pub actions: ActionTemplates,
    pub action_timeout: Duration,

    pub verbose: bool,
}

impl SourceConfig {
    /// Resolve the configuration of source `index`.
    ///
    /// Invalid values are reported and replaced by their defaults, this never fails.
    pub fn resolve(store: &KeyValueStore, index: usize) -> Self {
        let r = Resolver::new(store, index);

        let temp_file = r.string_or(
            "tempfile",
            &std::env::temp_dir()
                .join("cctvdiff-{index}.jpg")
                .to_string_lossy(),
        );

        let kernel = r.string("matrix").and_then(|m| match m.parse() {
            Ok(kernel) => Some(kernel),
            Err(e) => {
                warn!("[{}] Ignoring matrix: {}", index, e);
                None
            }
        });

        let threshold = r.number("threshold", 10.0);

        Self {
            index,
            name: r.name(),
            capture: r.capture_method(),
            temp_file: temp_file.into(),
            capture_timeout: r.duration("capturetimeout", 10.0),
            period: r.duration("period", 1.0),
            subsample: r.integer("subsample", 1).max(1),
            image_dir: r.string_or("imagedir", "/media/cctv").into(),
            filename: r.string_or("filename", DEFAULT_FILENAME),
            det_image_dir: r.string("detimagedir").map(PathBuf::from),
            det_filename: r.string_or("detfilename", DEFAULT_DET_FILENAME),
            det_log: r.string("detlog"),
            jpeg_quality: r.integer("jpegquality", 95).clamp(1, 100) as u8,
            difference: DifferenceSettings {
                channel_scale: [
                    r.number("rscale", 1.0),
                    r.number("gscale", 1.0),
                    r.number("bscale", 1.0),
                ],
                diff_gain: r.number("diffgain", 1.0),
                diff_threshold: r.number("diffthreshold", 0.25),
            },
            kernel,
            gain_image: r.string("gainimage").map(PathBuf::from),
            mask_image: r.string("maskimage").map(PathBuf::from),
            coefficients: BaselineCoefficients {
                fast_attack: r.number("fastattcoeff", 0.1),
                fast_decay: r.number("fastdecaycoeff", 0.05),
                slow_attack: r.number("slowattcoeff", 0.001),
                slow_decay: r.number("slowdecaycoeff", 0.01),
            },
            avg_factor: r.number("avgfactor", 1.0),
            sd_factor: r.number("sdfactor", 2.0),
            detection: DetectionSettings {
                threshold,
                log_threshold: r.number("logthreshold", threshold),
                predetection_images: r.integer("predetectionimages", 2) as usize,
                postdetection_images: r.integer("postdetectionimages", 2) as usize,
            },
            actions: ActionTemplates {
                detection_start: r.string("detstartcommand"),
                detection: r.string("detcommand"),
                detection_end: r.string("detendcommand"),
                no_detection: r.string("nodetcommand"),
            },
            action_timeout: r.duration("actiontimeout", 60.0),
            verbose: r.boolean("verbose", false),
        }
    }
}

/// Scoped lookups with placeholder substitution and type coercion.
pub struct Resolver<'a> {
    store: &'a KeyValueStore,
    index: usize,
}

impl<'a> Resolver<'a> {
    pub fn new(store: &'a KeyValueStore, index: usize) -> Self {
        Self { store, index }
    }

    /// Substituted value of `key`. Empty values count as unset.
    pub fn string(&self, key: &str) -> Option<String> {
        self.store
            .get_scoped(key, self.index)
            .filter(|v| !v.is_empty())
            .map(|v| self.substitute(v, 0))
    }

    pub fn string_or(&self, key: &str, default: &str) -> String {
        self.string(key)
            .unwrap_or_else(|| self.substitute(default, 0))
    }

    /// Source name, `cam{index}` unless configured.
    pub fn name(&self) -> String {
        self.string("name")
            .unwrap_or_else(|| format!("cam{}", self.index))
    }

    pub fn number(&self, key: &str, default: f64) -> f64 {
        self.parsed(key, default)
    }

    pub fn integer(&self, key: &str, default: u64) -> u64 {
        self.parsed(key, default)
    }

    /// Seconds as a [`Duration`]. Negative, non-finite and unrepresentable values fall back to
    /// `default_secs`.
    pub fn duration(&self, key: &str, default_secs: f64) -> Duration {
        let secs = self.number(key, default_secs);
        Duration::try_from_secs_f64(secs).unwrap_or_else(|_| {
            warn!("[{}] Invalid {}={}, using {}", self.index, key, secs, default_secs);
            Duration::try_from_secs_f64(default_secs).unwrap_or_default()
        })
    }

    pub fn boolean(&self, key: &str, default: bool) -> bool {
        match self.string(key) {
            None => default,
            Some(v) => parse_bool(&v).unwrap_or_else(|| {
                warn!("[{}] Invalid boolean {}={}, using {}", self.index, key, v, default);
                default
            }),
        }
    }

    fn parsed<T: FromStr + std::fmt::Display>(&self, key: &str, default: T) -> T {
        match self.string(key) {
            None => default,
            Some(v) => v.parse().unwrap_or_else(|_| {
                warn!("[{}] Invalid value {}={}, using {}", self.index, key, v, default);
                default
            }),
        }
    }

    /// Pick the capture method, in order of precedence.
    pub fn capture_method(&self) -> CaptureMethod {
        if let Some(url) = self.string("cameraurl") {
            let args = self.string_or("wgetargs", "");
            CaptureMethod::Command(join_command(&[
                "wget",
                &args,
                &format!("\"{}\"", url),
                "-O {file}",
            ]))
        } else if let Some(device) = self.string("videosrc") {
            let args = self.string_or("streamerargs", "-s 640x480");
            CaptureMethod::Command(join_command(&[
                "streamer",
                &format!("-c /dev/{}", device),
                &args,
                "-o {file}",
            ]))
        } else if let Some(cmd) = self.string("capturecmd") {
            CaptureMethod::Command(cmd)
        } else if let Some(dir) = self.string("sourcedir") {
            CaptureMethod::Directory(dir.into())
        } else {
            CaptureMethod::None
        }
    }

    /// Replace `{index}`, `{name}` and `{key}` references in `value`.
    ///
    /// Placeholders that name no configured key are kept verbatim, later stages fill those in.
    pub fn substitute(&self, value: &str, depth: usize) -> String {
        let mut out = String::with_capacity(value.len());
        let mut rest = value;

        while let Some(start) = rest.find('{') {
            out.push_str(&rest[..start]);
            let after = &rest[start + 1..];

            let end = match after.find('}') {
                Some(end) => end,
                None => {
                    rest = &rest[start..];
                    break;
                }
            };

            let key = &after[..end];
            let valid = !key.is_empty()
                && key
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');

            let value = if valid {
                self.placeholder(key, depth)
            } else {
                None
            };

            match value {
                Some(v) => out.push_str(&v),
                None => {
                    out.push('{');
                    out.push_str(key);
                    out.push('}');
                }
            }

            rest = &after[end + 1..];
        }

        out.push_str(rest);
        out
    }

    fn placeholder(&self, key: &str, depth: usize) -> Option<String> {
        match key {
            "index" => Some(self.index.to_string()),
            _ if depth >= MAX_SUBSTITUTION_DEPTH => {
                warn!("[{}] Placeholder {{{}}} nested too deeply", self.index, key);
                None
            }
            "name" => Some(
                self.store
                    .get_scoped("name", self.index)
                    .filter(|v| !v.is_empty())
                    .map(|v| self.substitute(v, depth + 1))
                    .unwrap_or_else(|| format!("cam{}", self.index)),
            ),
            _ => self
                .store
                .get_scoped(key, self.index)
                .map(|v| self.substitute(v, depth + 1)),
        }
    }
}

fn join_command(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn defaults() {
        let store = KeyValueStore::parse("");
        let c = SourceConfig::resolve(&store, 3);
        assert_eq!(c.name, "cam3");
        assert_eq!(c.capture, CaptureMethod::None);
        assert_eq!(c.period, Duration::from_secs(1));
        assert_eq!(c.subsample, 1);
        assert_eq!(c.image_dir, PathBuf::from("/media/cctv"));
        assert_eq!(
            c.filename,
            "%Y-%m-%d/%H/3/Image-{seqno}-%Y-%m-%d-%H-%M-%S-%3f"
        );
        assert!(c.temp_file.to_string_lossy().ends_with("cctvdiff-3.jpg"));
        assert_eq!(c.jpeg_quality, 95);
        assert_eq!(c.difference, DifferenceSettings::default());
        assert_eq!(c.coefficients, BaselineCoefficients::default());
        assert_eq!(c.detection, DetectionSettings::default());
        assert_eq!(c.actions, ActionTemplates::default());
        assert!(c.kernel.is_none());
        assert!(!c.verbose);

        let g = GlobalConfig::resolve(&store);
        assert_eq!(g.sources, 1);
        assert_eq!(g.log_location, None);
        assert_eq!(g.stats_interval, Duration::from_secs(2));
    }

    #[test]
    fn overrides_and_coercion() {
        let store = KeyValueStore::parse(
            "threshold=20\nthreshold:2=30\nlogthreshold:2=5\nverbose=Yes\nperiod=0.25\n\
             predetectionimages=4\nmatrix=1,2,1*1/4\nrscale=0.5\n",
        );

        let c1 = SourceConfig::resolve(&store, 1);
        assert_approx_eq!(c1.detection.threshold, 20.0);
        assert_approx_eq!(c1.detection.log_threshold, 20.0);
        assert_eq!(c1.detection.predetection_images, 4);
        assert!(c1.verbose);
        assert_eq!(c1.period, Duration::from_millis(250));
        assert_eq!(c1.difference.channel_scale, [0.5, 1.0, 1.0]);
        assert_eq!(c1.kernel.as_ref().map(|k| k.width()), Some(3));

        let c2 = SourceConfig::resolve(&store, 2);
        assert_approx_eq!(c2.detection.threshold, 30.0);
        assert_approx_eq!(c2.detection.log_threshold, 5.0);
    }

    #[test]
    fn invalid_values_use_defaults() {
        let store = KeyValueStore::parse("threshold=lots\nverbose=maybe\nperiod=-1\nmatrix=1,x\n");
        let c = SourceConfig::resolve(&store, 1);
        assert_approx_eq!(c.detection.threshold, 10.0);
        assert!(!c.verbose);
        assert_eq!(c.period, Duration::from_secs(1));
        assert!(c.kernel.is_none());
    }

    #[test]
    fn oversized_durations_use_defaults() {
        let store = KeyValueStore::parse("period=1e20
capturetimeout=inf
statsinterval=1e300
");
        let c = SourceConfig::resolve(&store, 1);
        assert_eq!(c.period, Duration::from_secs(1));
        assert_eq!(c.capture_timeout, Duration::from_secs(10));
        assert_eq!(
            GlobalConfig::resolve(&store).stats_interval,
            Duration::from_secs(2)
        );
    }

    #[test]
    fn placeholders() {
        let store = KeyValueStore::parse(
            "base=/srv/{name}\nimagedir={base}/images\nname:2=door\ncapturecmd=grab {index} {file}\n",
        );
        let r = Resolver::new(&store, 2);
        assert_eq!(r.string("imagedir").unwrap(), "/srv/door/images");
        assert_eq!(r.string("capturecmd").unwrap(), "grab 2 {file}");

        let r = Resolver::new(&store, 1);
        assert_eq!(r.string("imagedir").unwrap(), "/srv/cam1/images");
        assert_eq!(r.substitute("{unknown} { spaced } {", 0), "{unknown} { spaced } {");
    }

    #[test]
    fn recursive_placeholders_are_bounded() {
        let store = KeyValueStore::parse("a={b}\nb={a}\n");
        let r = Resolver::new(&store, 1);
        let v = r.string("a").unwrap();
        assert!(v == "{a}" || v == "{b}", "{}", v);
    }

    #[test]
    fn capture_precedence() {
        let store = KeyValueStore::parse(
            "cameraurl=http://cam/{index}.jpg\nvideosrc=video0\ncapturecmd=x\nsourcedir=/d\n",
        );
        assert_eq!(
            Resolver::new(&store, 1).capture_method(),
            CaptureMethod::Command("wget \"http://cam/1.jpg\" -O {file}".into())
        );

        let store = KeyValueStore::parse("videosrc=video0\ncapturecmd=x\n");
        assert_eq!(
            Resolver::new(&store, 1).capture_method(),
            CaptureMethod::Command("streamer -c /dev/video0 -s 640x480 -o {file}".into())
        );

        let store = KeyValueStore::parse("sourcedir=/d/{index}\n");
        assert_eq!(
            Resolver::new(&store, 4).capture_method(),
            CaptureMethod::Directory("/d/4".into())
        );
    }

    #[test]
    fn booleans() {
        for (s, v) in [("1", true), ("ON", true), ("no", false), ("False", false)] {
            assert_eq!(parse_bool(s), Some(v));
        }
        assert_eq!(parse_bool("2"), None);
    }
}
