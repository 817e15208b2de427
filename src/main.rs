use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use fsapack::format::{
    fileend, mainhead, object, CompressAlgo, CryptAlgo, MAGIC_FILEEND, MAGIC_MAIN, MAGIC_OBJECT,
};
use fsapack::io_stream::{ArchiveItem, ArchiveReader};
use fsapack::options::ArchiveOptions;
use fsapack::stats::StatsSnapshot;
use fsapack::util::format_size;
use fsapack::{run_pack, run_unpack, ObjType, PipelineError};

#[derive(Parser)]
#[command(name = "fsapack", version, about = "Multi-threaded filesystem archiver (.fsa format)")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Archive files and directories into a .fsa archive
    Pack {
        /// Archive path (".fsa" is appended when missing)
        #[arg(short, long)]
        output: PathBuf,
        /// Codec: gzip (default), zstd, lz4, bzip2, lzma, none
        #[arg(short = 'z', long, default_value = "gzip")]
        codec: String,
        #[arg(short, long, default_value = "6")]
        level: u8,
        /// Transformer threads (default: one per core)
        #[arg(short, long)]
        jobs: Option<usize>,
        /// Block size in KiB
        #[arg(short, long, default_value = "256")]
        block_size: u64,
        /// Split into volumes of this many MiB (0 = single file)
        #[arg(short = 's', long, default_value = "0")]
        split: u64,
        /// Encrypt every block with Blowfish-CFB
        #[arg(short, long)]
        password: Option<String>,
        /// Free-form label stored in the archive
        #[arg(long)]
        label: Option<String>,
        /// Print final statistics as JSON
        #[arg(long)]
        json: bool,
        #[arg(required = true, num_args = 1..)]
        input: Vec<PathBuf>,
    },
    /// Restore a .fsa archive into a directory
    Unpack {
        input: PathBuf,
        #[arg(short = 'C', long, default_value = ".")]
        dest: PathBuf,
        #[arg(short, long)]
        jobs: Option<usize>,
        #[arg(short, long)]
        password: Option<String>,
        /// Print final statistics as JSON
        #[arg(long)]
        json: bool,
    },
    /// List archive contents without restoring
    List {
        input: PathBuf,
    },
    /// Show archive metadata
    Info {
        input: PathBuf,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("fsapack: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode, Box<dyn std::error::Error>> {
    match Cli::parse().command {
        // ── Pack ─────────────────────────────────────────────────────────────
        Commands::Pack {
            output,
            codec,
            level,
            jobs,
            block_size,
            split,
            password,
            label,
            json,
            input,
        } => {
            let mut opts = ArchiveOptions {
                compress_algo: parse_codec(&codec),
                compress_level: level,
                block_size: block_size * 1024,
                volume_size: split * 1024 * 1024,
                label,
                ..ArchiveOptions::default()
            };
            if let Some(jobs) = jobs {
                opts.jobs = jobs;
            }
            if let Some(pwd) = password {
                opts = opts.with_password(pwd);
            }
            let stats = run_pack(opts, input, &output)?;
            Ok(finish("pack", &stats, json))
        }

        // ── Unpack ───────────────────────────────────────────────────────────
        Commands::Unpack { input, dest, jobs, password, json } => {
            let mut opts = ArchiveOptions::default();
            if let Some(jobs) = jobs {
                opts.jobs = jobs;
            }
            if let Some(pwd) = password {
                opts = opts.with_password(pwd);
            }
            match run_unpack(opts, &input, &dest) {
                Ok(stats) => Ok(finish("unpack", &stats, json)),
                Err(PipelineError::Crypto(e)) => {
                    eprintln!("fsapack: {e}");
                    Ok(ExitCode::FAILURE)
                }
                Err(e) => Err(e.into()),
            }
        }

        // ── List ─────────────────────────────────────────────────────────────
        Commands::List { input } => {
            let mut reader = ArchiveReader::open(&input)?;
            println!("{:<9} {:>12}  {:<14} Path", "Type", "Size", "Content hash");
            // Regular files are printed when their file-end record (with the
            // content hash) arrives; everything else prints immediately.
            let mut open_file: Option<(String, u64)> = None;
            while let Some(item) = reader.skim_item()? {
                let ArchiveItem::Header(head) = item else { continue };
                if &head.magic == MAGIC_OBJECT {
                    let objtype = head
                        .dico
                        .get_u16(object::KEY_TYPE)?
                        .and_then(ObjType::from_u16);
                    let path = head
                        .dico
                        .get_bytes(object::KEY_PATH)?
                        .map(|b| String::from_utf8_lossy(b).into_owned())
                        .unwrap_or_default();
                    if objtype == Some(ObjType::RegFile) {
                        let size = head.dico.get_uint(object::KEY_SIZE)?.unwrap_or(0);
                        open_file = Some((path, size));
                    } else {
                        println!(
                            "{:<9} {:>12}  {:<14} {}",
                            objtype.map(|t| t.name()).unwrap_or("?"),
                            "-",
                            "-",
                            path
                        );
                    }
                } else if &head.magic == MAGIC_FILEEND {
                    if let Some((path, size)) = open_file.take() {
                        let hash = head
                            .dico
                            .get_bytes(fileend::KEY_CONTENT_HASH)?
                            .map(|h| hex::encode(&h[..h.len().min(6)]))
                            .unwrap_or_else(|| "-".into());
                        println!("{:<9} {:>12}  {:<14} {}", "regfile", size, hash, path);
                    }
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { input } => {
            let mut reader = ArchiveReader::open(&input)?;
            let file_size = std::fs::metadata(&input)?.len();
            let Some(ArchiveItem::Header(main)) = reader.skim_item()? else {
                return Err("archive does not start with a main header".into());
            };
            if &main.magic != MAGIC_MAIN {
                return Err("archive does not start with a main header".into());
            }
            let d = &main.dico;

            println!("── .fsa archive ─────────────────────────────────────────");
            println!("  Path            {}", input.display());
            println!("  Volume 0 size   {}", format_size(file_size));
            println!("  Format version  {}", d.get_u32(mainhead::KEY_VERSION)?.unwrap_or(0));
            println!("  Archive id      {:#010x}", reader.archive_id());
            if let Some(label) = d.get_bytes(mainhead::KEY_LABEL)? {
                println!("  Label           {}", String::from_utf8_lossy(label));
            }
            if let Some(t) = d.get_uint(mainhead::KEY_CREATE_TIME)? {
                println!("  Created (unix)  {t}");
            }
            println!(
                "  Compression     {}",
                d.get_u16(mainhead::KEY_COMPRESS_ALGO)?
                    .and_then(CompressAlgo::from_u16)
                    .map(|a| a.name())
                    .unwrap_or("?")
            );
            println!(
                "  Encryption      {}",
                d.get_u16(mainhead::KEY_CRYPT_ALGO)?
                    .and_then(CryptAlgo::from_u16)
                    .map(|a| a.name())
                    .unwrap_or("?")
            );
            println!(
                "  Block size      {}",
                format_size(d.get_uint(mainhead::KEY_BLOCK_SIZE)?.unwrap_or(0))
            );
            println!("  Filesystems     {}", d.get_u16(mainhead::KEY_FSCOUNT)?.unwrap_or(0));
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Print statistics and derive the exit status: non-zero when any error
/// counter is non-zero.
fn finish(verb: &str, stats: &StatsSnapshot, json: bool) -> ExitCode {
    if json {
        match serde_json::to_string_pretty(stats) {
            Ok(s) => println!("{s}"),
            Err(e) => eprintln!("fsapack: cannot serialize statistics: {e}"),
        }
    } else {
        println!("{stats}");
        println!("{verb} processed {}", format_size(stats.data_bytes));
    }
    if stats.err_regfiles
        + stats.err_directories
        + stats.err_symlinks
        + stats.err_hardlinks
        + stats.err_specials
        > 0
    {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn parse_codec(s: &str) -> CompressAlgo {
    CompressAlgo::from_name(s).unwrap_or_else(|| {
        eprintln!("Unknown codec '{s}', defaulting to gzip");
        CompressAlgo::Gzip
    })
}
