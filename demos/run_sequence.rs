// demos/run_sequence.rs
//
// Run monocular visual odometry over a directory of images.
//
// Usage:
//   cargo run --example run_sequence --release -- <image_dir> <intrinsics.json> [max_frames]
//
// Images are taken in file-name order (PNG or JPEG). The intrinsics file:
//
//   {
//     "K": { "fx": 458.654, "fy": 457.296, "cx": 367.215, "cy": 248.375 },
//     "dist_coeffs": { "k1": -0.2834, "k2": 0.0739, "p1": 0.0002, "p2": 1.76e-05, "k3": 0.0 }
//   }
//
// `dist_coeffs` and any of its entries may be omitted.
//
// Output:
//   stdout — trajectory as JSON, one entry per processed frame
//   stderr — log output; set RUST_LOG=debug for per-frame detail

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use log::{info, warn};
use serde::Deserialize;

use mono_vo::{
    CameraIntrinsics, ImageSource, InputImage, OdometryConfig, OdometryEngine, OdometryError, PixelLayout,
};

#[derive(Debug, Deserialize)]
struct IntrinsicsFile {
    #[serde(rename = "K")]
    k: PinholeParams,
    #[serde(default)]
    dist_coeffs: DistortionParams,
}

#[derive(Debug, Deserialize)]
struct PinholeParams {
    fx: f64,
    fy: f64,
    cx: f64,
    cy: f64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DistortionParams {
    k1: f64,
    k2: f64,
    p1: f64,
    p2: f64,
    k3: f64,
}

/// Images in a directory, decoded lazily in file-name order.
struct DirectorySource {
    files: Vec<PathBuf>,
}

impl DirectorySource {
    fn open(dir: &Path, max_frames: usize) -> std::io::Result<Self> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| matches!(e.to_ascii_lowercase().as_str(), "png" | "jpg" | "jpeg"))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();
        files.truncate(max_frames);
        Ok(DirectorySource { files })
    }
}

impl ImageSource for DirectorySource {
    fn count(&self) -> usize {
        self.files.len()
    }

    fn get(&self, index: usize) -> Option<InputImage> {
        let path = self.files.get(index)?;
        match image::open(path) {
            Ok(img) => {
                let rgb = img.to_rgb8();
                let (w, h) = rgb.dimensions();
                Some(InputImage::new(w as usize, h as usize, PixelLayout::Rgb, rgb.into_raw()))
            }
            Err(e) => {
                warn!("failed to load {}: {e}", path.display());
                None
            }
        }
    }
}

fn load_intrinsics(path: &Path) -> Result<CameraIntrinsics, String> {
    let text = fs::read_to_string(path).map_err(|e| format!("{}: {e}", path.display()))?;
    let parsed: IntrinsicsFile = serde_json::from_str(&text).map_err(|e| format!("{}: {e}", path.display()))?;
    let d = parsed.dist_coeffs;
    CameraIntrinsics::new(parsed.k.fx, parsed.k.fy, parsed.k.cx, parsed.k.cy, [d.k1, d.k2, d.p1, d.p2, d.k3])
        .map_err(|e| e.to_string())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: {} <image_dir> <intrinsics.json> [max_frames]", args[0]);
        eprintln!("  Optional: max_frames limits processing (default: all)");
        process::exit(1);
    }
    let image_dir = PathBuf::from(&args[1]);
    let max_frames: usize = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(usize::MAX);

    let camera = load_intrinsics(Path::new(&args[2])).unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        process::exit(1);
    });
    let source = DirectorySource::open(&image_dir, max_frames).unwrap_or_else(|e| {
        eprintln!("Error: {}: {e}", image_dir.display());
        process::exit(1);
    });
    info!("{} images in {}", source.count(), image_dir.display());

    let mut engine = OdometryEngine::new(source, camera, OdometryConfig::default()).unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        process::exit(1);
    });

    match engine.run() {
        Ok(n) => info!("processed {n} frames"),
        // Whatever was committed before the halt is still a valid trajectory.
        Err(e @ OdometryError::DegenerateGeometry(_)) | Err(e @ OdometryError::InsufficientCorrespondences { .. }) => {
            warn!("stopped early: {e}")
        }
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }

    match serde_json::to_string_pretty(&engine.trajectory()) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}
