use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::{Parser, Subcommand, value_parser};
use itertools::Itertools;
use log::warn;

use crate::world::coordinates::{GRID_SIZE, TileCoord};

#[derive(Parser, Debug)]
#[command(name = "tilestream")]
#[command(version)]
#[command(about = "Streams the tiles of a world map in and out of memory, like the editor does")]
pub struct CliArgs {
    #[arg(long, env = "TILESTREAM_DATA_DIR", default_value_t = default_data_dir())]
    pub data_dir: String,

    /// Loader worker threads, defaults to the available parallelism.
    #[arg(long, env = "TILESTREAM_THREADS")]
    pub threads: Option<usize>,

    #[arg(long)]
    pub load_radius: Option<u32>,

    #[arg(long)]
    pub unload_radius: Option<u32>,

    #[arg(long)]
    pub unload_interval_ms: Option<u64>,

    #[command(subcommand)]
    pub operation_mode: OperationMode,
}

pub fn default_data_dir() -> String {
    std::env::current_dir()
        .map(|dir| dir.join("_data"))
        .unwrap_or_else(|_| PathBuf::from("_data"))
        .to_string_lossy()
        .to_string()
}

#[derive(Subcommand, Debug)]
pub enum OperationMode {
    /// Moves a virtual camera from one tile to another, streaming tiles in and out on the way.
    Walk {
        map_name: String,
        #[arg(value_parser = value_parser!(TileArg))]
        from: TileArg,
        #[arg(value_parser = value_parser!(TileArg))]
        to: TileArg,
    },
    /// Synchronously loads every tile of a rectangle and prints what it references.
    Export {
        map_name: String,
        #[arg(value_parser = value_parser!(RectArg))]
        rect: RectArg,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamingSettings {
    pub worker_threads: usize,
    /// Chebyshev radius (in tiles) around the camera tile that is kept requested.
    pub load_radius: u32,
    /// Tiles farther away than this are evicted, once they were out of range for `unload_interval`.
    pub unload_radius: u32,
    pub unload_interval: Duration,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            worker_threads: std::thread::available_parallelism()
                .map(|threads| threads.get())
                .unwrap_or(1),
            load_radius: 1,
            unload_radius: 2,
            unload_interval: Duration::from_secs(5),
        }
    }
}

impl StreamingSettings {
    pub fn from_args(args: &CliArgs) -> Self {
        let defaults = Self::default();
        Self {
            worker_threads: args.threads.unwrap_or(defaults.worker_threads),
            load_radius: args.load_radius.unwrap_or(defaults.load_radius),
            unload_radius: args.unload_radius.unwrap_or(defaults.unload_radius),
            unload_interval: args
                .unload_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.unload_interval),
        }
        .validated()
    }

    /// A tile evicted right after it was requested would thrash, so the unload radius never drops
    /// below the load radius.
    pub fn validated(mut self) -> Self {
        if self.worker_threads == 0 {
            warn!("Zero loader threads requested, using one");
            self.worker_threads = 1;
        }

        let max_radius = GRID_SIZE as u32;
        if self.load_radius > max_radius || self.unload_radius > max_radius {
            warn!("Radii beyond {} tiles cover the whole grid, clamping them", max_radius);
            self.load_radius = self.load_radius.min(max_radius);
            self.unload_radius = self.unload_radius.min(max_radius);
        }

        if self.unload_radius < self.load_radius {
            warn!(
                "Unload radius {} is smaller than the load radius {}, raising it",
                self.unload_radius, self.load_radius
            );
            self.unload_radius = self.load_radius;
        }
        self
    }
}

fn trim_brackets(input: &str) -> &str {
    let mut chars = input.chars();
    chars.next(); // skip first
    chars.next_back(); // skip last
    chars.as_str()
}

/// `(a, b, ...)` with exactly `N` integer components.
fn parse_components<const N: usize>(s: &str) -> Result<[i32; N], String> {
    let string: String = s.chars().filter(|&c| !c.is_whitespace()).collect();
    if !string.starts_with('(') || !string.ends_with(')') {
        return Err("Missing start or end bracket".to_string());
    }

    let splits = trim_brackets(string.as_str()).split(',').collect_vec();
    if splits.len() != N {
        return Err(format!(
            "Comma splitting resulted in {} splits, not {}!",
            splits.len(),
            N
        ));
    }

    let components = splits
        .iter()
        .map(|&split| {
            split
                .parse::<i32>()
                .map_err(|err| format!("Failed to parse component {:?}: {}", split, err))
        })
        .collect::<Result<Vec<i32>, String>>()?;

    components
        .try_into()
        .map_err(|_| "Unexpected component count".to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileArg(pub TileCoord);

impl FromStr for TileArg {
    type Err = String;

    // (x, y)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let [x, y] = parse_components::<2>(s)?;
        Ok(TileArg(TileCoord::new(x, y)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RectArg {
    pub min: TileCoord,
    pub max: TileCoord,
}

impl RectArg {
    pub fn contains(&self, coord: TileCoord) -> bool {
        (self.min.x..=self.max.x).contains(&coord.x) && (self.min.y..=self.max.y).contains(&coord.y)
    }
}

impl FromStr for RectArg {
    type Err = String;

    // (x0, y0, x1, y1), corners in any order
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let [x0, y0, x1, y1] = parse_components::<4>(s)?;
        Ok(RectArg {
            min: TileCoord::new(x0.min(x1), y0.min(y1)),
            max: TileCoord::new(x0.max(x1), y0.max(y1)),
        })
    }
}
