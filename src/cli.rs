//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

use harvester_core::EngineConfig;
use harvester_core::crawl::TraversalOrder;
use harvester_core::download::{Concurrency, ExistingFilePolicy};
use harvester_core::task::{CrawlParams, PlaylistParams, ProcessingParams, TaskParams};

/// Crawl, download and process documents with live progress.
///
/// Progress events are written to stdout as JSON lines; logs go to stderr.
/// Press Ctrl-C once to cancel cooperatively, twice to force.
#[derive(Parser, Debug)]
#[command(name = "harvester")]
#[command(author, version, about)]
pub struct Args {
    /// Increase log verbosity (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (default: $XDG_CONFIG_HOME/harvester/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Maximum concurrent downloads (1-100 or "unlimited")
    #[arg(short = 'c', long, global = true)]
    pub concurrency: Option<Concurrency>,

    /// Maximum retry attempts for transient failures (0-10)
    #[arg(short = 'r', long, global = true, value_parser = clap::value_parser!(u32).range(0..=10))]
    pub max_retries: Option<u32>,

    /// Minimum delay between downloads from one domain in milliseconds (0 disables, max 60000)
    #[arg(short = 'l', long, global = true, value_parser = clap::value_parser!(u64).range(0..=60000))]
    pub rate_limit: Option<u64>,

    /// Directory downloads are written to
    #[arg(short = 'o', long, global = true, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// What to do when a target file exists: skip, overwrite or rename
    #[arg(long, global = true, value_name = "POLICY")]
    pub existing: Option<ExistingFilePolicy>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Crawl from a seed URL and download the documents found
    Crawl(CrawlArgs),
    /// Process every file under a directory
    Process(ProcessArgs),
    /// Download a list of URLs
    Download(DownloadArgs),
}

#[derive(ClapArgs, Debug)]
pub struct CrawlArgs {
    /// Seed URL
    pub url: String,

    /// Follow links at most this many levels below the seed
    #[arg(short = 'd', long)]
    pub max_depth: Option<u32>,

    /// Stop fetching a host after this many pages
    #[arg(long)]
    pub max_pages: Option<usize>,

    /// Also crawl this domain and its subdomains (repeatable)
    #[arg(long = "allow-domain", value_name = "DOMAIN")]
    pub allow_domains: Vec<String>,

    /// Do not consult robots.txt
    #[arg(long)]
    pub ignore_robots: bool,

    /// Minimum gap between requests to one host in milliseconds
    #[arg(long, value_parser = clap::value_parser!(u64).range(0..=60000))]
    pub crawl_delay: Option<u64>,

    /// Traverse depth-first instead of breadth-first
    #[arg(long)]
    pub depth_first: bool,

    /// Pages fetched at once
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..=32))]
    pub fetch_concurrency: Option<u64>,

    /// Extension marking a link as a document to download (repeatable, default pdf)
    #[arg(long = "extension", value_name = "EXT")]
    pub extensions: Vec<String>,

    /// Report documents without downloading them
    #[arg(long)]
    pub discover_only: bool,
}

#[derive(ClapArgs, Debug)]
pub struct ProcessArgs {
    /// Directory to process
    pub dir: PathBuf,

    /// Only process files with this extension (repeatable)
    #[arg(long = "extension", value_name = "EXT")]
    pub extensions: Vec<String>,
}

#[derive(ClapArgs, Debug)]
pub struct DownloadArgs {
    /// URLs to download
    #[arg(required = true)]
    pub urls: Vec<String>,
}

impl Args {
    /// Applies command-line overrides on top of file configuration.
    pub fn apply_overrides(&self, config: &mut EngineConfig) {
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(max_retries) = self.max_retries {
            config.max_retries = max_retries;
        }
        if let Some(rate_limit) = self.rate_limit {
            config.rate_limit_ms = rate_limit;
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir.clone_from(dir);
        }
        if let Some(policy) = self.existing {
            config.existing_files = policy;
        }
    }

    /// Task parameters for the chosen subcommand.
    #[must_use]
    pub fn task_params(&self, config: &EngineConfig) -> TaskParams {
        match &self.command {
            Command::Crawl(args) => {
                let mut options = config.crawl.clone();
                if let Some(depth) = args.max_depth {
                    options.max_depth = depth;
                }
                if let Some(max_pages) = args.max_pages {
                    options.max_pages_per_domain = max_pages;
                }
                if !args.allow_domains.is_empty() {
                    options.domain_allowlist = Some(args.allow_domains.clone());
                }
                if args.ignore_robots {
                    options.respect_robots = false;
                }
                if let Some(delay) = args.crawl_delay {
                    options.crawl_delay_ms = delay;
                }
                if args.depth_first {
                    options.order = TraversalOrder::DepthFirst;
                }
                if let Some(width) = args.fetch_concurrency.and_then(|w| usize::try_from(w).ok()) {
                    options.fetch_concurrency = width;
                }
                if !args.extensions.is_empty() {
                    options.target_extensions = normalize_extensions(&args.extensions);
                }
                TaskParams::Crawl(CrawlParams {
                    seed_url: args.url.clone(),
                    options: Some(options),
                    output_dir: (!args.discover_only).then(|| config.output_dir.clone()),
                })
            }
            Command::Process(args) => TaskParams::Processing(ProcessingParams {
                root: args.dir.clone(),
                extensions: normalize_extensions(&args.extensions),
            }),
            Command::Download(args) => TaskParams::Playlist(PlaylistParams {
                playlist: args.urls.join("\n"),
                output_dir: Some(config.output_dir.clone()),
            }),
        }
    }
}

fn normalize_extensions(extensions: &[String]) -> Vec<String> {
    extensions
        .iter()
        .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_crawl_defaults() {
        let args = Args::try_parse_from(["harvester", "crawl", "https://example.com"]).unwrap();
        assert_eq!(args.verbose, 0);
        assert!(!args.quiet);
        assert!(args.concurrency.is_none());

        let config = EngineConfig::default();
        let TaskParams::Crawl(params) = args.task_params(&config) else {
            panic!("expected crawl params");
        };
        assert_eq!(params.seed_url, "https://example.com");
        assert_eq!(params.options.unwrap(), config.crawl);
        assert_eq!(params.output_dir, Some(config.output_dir));
    }

    #[test]
    fn test_cli_verbose_flag_after_subcommand() {
        let args = Args::try_parse_from(["harvester", "process", "docs", "-vv"]).unwrap();
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn test_cli_crawl_overrides() {
        let args = Args::try_parse_from([
            "harvester",
            "crawl",
            "https://example.com",
            "-d",
            "4",
            "--allow-domain",
            "example.com",
            "--ignore-robots",
            "--depth-first",
            "--extension",
            ".PDF",
            "--extension",
            "epub",
            "--discover-only",
        ])
        .unwrap();
        let TaskParams::Crawl(params) = args.task_params(&EngineConfig::default()) else {
            panic!("expected crawl params");
        };
        let options = params.options.unwrap();
        assert_eq!(options.max_depth, 4);
        assert_eq!(options.domain_allowlist, Some(vec!["example.com".to_string()]));
        assert!(!options.respect_robots);
        assert_eq!(options.order, TraversalOrder::DepthFirst);
        assert_eq!(options.target_extensions, vec!["pdf", "epub"]);
        assert!(params.output_dir.is_none());
    }

    #[test]
    fn test_cli_global_overrides_apply_to_config() {
        let args = Args::try_parse_from([
            "harvester",
            "download",
            "https://a.test/x.pdf",
            "-c",
            "unlimited",
            "-r",
            "0",
            "-l",
            "0",
            "-o",
            "out",
            "--existing",
            "rename",
        ])
        .unwrap();
        let mut config = EngineConfig::default();
        args.apply_overrides(&mut config);
        assert_eq!(config.concurrency, Concurrency::Unlimited);
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.rate_limit_ms, 0);
        assert_eq!(config.output_dir, PathBuf::from("out"));
        assert_eq!(config.existing_files, ExistingFilePolicy::Rename);

        let TaskParams::Playlist(params) = args.task_params(&config) else {
            panic!("expected playlist params");
        };
        assert_eq!(params.playlist, "https://a.test/x.pdf");
    }

    #[test]
    fn test_cli_download_requires_urls() {
        let err = Args::try_parse_from(["harvester", "download"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_cli_subcommand_required() {
        assert!(Args::try_parse_from(["harvester"]).is_err());
    }

    #[test]
    fn test_cli_max_retries_over_max_rejected() {
        let err =
            Args::try_parse_from(["harvester", "process", "d", "-r", "11"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_cli_version_flag_shows_version() {
        let err = Args::try_parse_from(["harvester", "--version"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
    }
}
