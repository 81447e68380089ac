//! Command-line interface for the arksigning library.
//!
//! Signs `.ipa` archives and extracted app folders, injects dylibs into
//! bare Mach-O binaries, prints app information, and drives the bulk
//! signing mode across a worker pool.

use arksigning::batch::{run_batch, BatchOptions, LogSink};
use arksigning::bundle::{app_info, BundleSigner, SignOptions};
use arksigning::crypto::SigningIdentity;
use arksigning::ipa::{self, CompressionLevel};
use arksigning::macho::MachOFile;
use clap::Parser;
use secrecy::SecretString;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "arksigning")]
#[command(about = "iOS app bundle code signing tool")]
#[command(version)]
struct Cli {
    /// Input .ipa archive, app folder, or Mach-O binary
    input: Option<PathBuf>,

    /// Path to private key or PKCS#12 file (PEM or DER format)
    #[arg(short = 'k', long = "pkey")]
    private_key: Option<PathBuf>,

    /// Path to certificate file (PEM or DER format)
    #[arg(short = 'c', long = "cert")]
    certificate: Option<PathBuf>,

    /// Path to mobile provisioning profile
    #[arg(short = 'm', long = "prov")]
    profile: Option<PathBuf>,

    /// Password for private key or PKCS#12 file
    #[arg(short = 'p', long = "password")]
    password: Option<String>,

    /// Path to entitlements plist (default: from provisioning profile)
    #[arg(short = 'e', long = "entitlements")]
    entitlements: Option<PathBuf>,

    /// New bundle id to change (reserved)
    #[arg(short = 'b', long = "bundle-id")]
    bundle_id: Option<String>,

    /// New bundle name to change (reserved)
    #[arg(short = 'n', long = "bundle-name")]
    bundle_name: Option<String>,

    /// New bundle version to change (reserved)
    #[arg(short = 'r', long = "bundle-version")]
    bundle_version: Option<String>,

    /// Path to dylib to inject; repeat to inject multiple
    #[arg(short = 'l', long = "dylib")]
    dylibs: Vec<PathBuf>,

    /// Inject dylibs as LC_LOAD_WEAK_DYLIB
    #[arg(short = 'w', long = "weak")]
    weak: bool,

    /// Force full re-sign, ignoring the incremental cache
    #[arg(short = 'f', long = "force")]
    force: bool,

    /// Do not generate embedded.mobileprovision
    #[arg(short = 'E', long = "no-embed-profile")]
    no_embed_profile: bool,

    /// Path to output .ipa file
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// ZIP compression level for the output .ipa (0-9)
    #[arg(short = 'z', long = "zip-level", default_value = "0")]
    zip_level: u32,

    /// Install the output .ipa with ideviceinstaller
    #[arg(short = 'i', long = "install")]
    install: bool,

    /// Print app information as JSON and exit
    #[arg(short = 'I', long = "info")]
    info: bool,

    /// Quiet operation
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,

    /// Verbose debug output
    #[arg(short = 'd', long = "debug")]
    debug: bool,

    /// Bulk signing mode
    #[arg(short = 'B', long = "bulk")]
    bulk: bool,

    /// Folder of unsigned apps to process (bulk mode)
    #[arg(long = "inputfolder")]
    input_folder: Option<PathBuf>,

    /// Destination folder for signed apps (bulk mode)
    #[arg(long = "outputfolder")]
    output_folder: Option<PathBuf>,

    /// Worker count for bulk mode; omit the value to auto-detect
    #[arg(long = "parallel", num_args = 0..=1, default_missing_value = "0")]
    parallel: Option<usize>,
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.quiet {
        "error"
    } else if cli.debug {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level))
        .with_target(false)
        .init();

    if let Err(e) = run(cli) {
        tracing::error!("{}", e);
        std::process::exit(-1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    if cli.bundle_id.is_some() || cli.bundle_name.is_some() || cli.bundle_version.is_some() {
        tracing::warn!("bundle id/name/version overrides are reserved and currently ignored");
    }

    if cli.info {
        return print_app_info(&cli);
    }
    if cli.bulk {
        return run_bulk(&cli);
    }

    let input = cli
        .input
        .clone()
        .ok_or("missing input file or folder (see --help)")?;
    if !input.exists() {
        return Err(format!("invalid path: {}", input.display()).into());
    }

    // A bare Mach-O gets dylib injection or an info dump, no identity needed.
    if input.is_file() && !ipa::is_zip_file(&input) {
        return process_macho(&cli, &input);
    }

    let identity = load_identity(&cli)?;

    let is_archive = input.is_file();
    let mut options = sign_options(&cli);

    let (app_folder, _extract_dir) = if is_archive {
        let temp = tempfile::Builder::new()
            .prefix("arksigning_folder_")
            .tempdir()?;
        info!(input = %input.display(), dest = %temp.path().display(), "unzip");
        ipa::extract_archive(&input, temp.path())?;

        options.force = true;
        options.enable_cache = false;
        let folder = BundleSigner::new(&identity, options).sign_folder(temp.path())?;
        (folder, Some(temp))
    } else {
        let folder = BundleSigner::new(&identity, options).sign_folder(&input)?;
        (folder, None)
    };

    let mut output = cli.output.clone();
    if cli.install && output.is_none() {
        output = Some(
            std::env::temp_dir().join(format!("arksigning_temp_{}.ipa", std::process::id())),
        );
    }

    if let Some(ref output_path) = output {
        info!(output = %output_path.display(), "archiving");
        ipa::create_ipa(
            &app_folder,
            output_path,
            CompressionLevel::new(cli.zip_level),
        )?;
    }

    if cli.install {
        let output_path = output.as_ref().expect("install implies an output path");
        let status = Command::new("ideviceinstaller")
            .arg("-i")
            .arg(output_path)
            .status()?;
        if cli.output.is_none() {
            let _ = std::fs::remove_file(output_path);
        }
        if !status.success() {
            return Err("ideviceinstaller failed".into());
        }
    }

    Ok(())
}

fn sign_options(cli: &Cli) -> SignOptions {
    SignOptions {
        force: cli.force,
        weak_inject: cli.weak,
        dylibs: cli.dylibs.clone(),
        embed_profile: !cli.no_embed_profile,
        enable_cache: true,
    }
}

fn load_identity(cli: &Cli) -> Result<SigningIdentity, Box<dyn Error>> {
    let key = cli
        .private_key
        .as_deref()
        .ok_or("missing private key or PKCS#12 file (-k)")?;
    let profile = cli
        .profile
        .as_deref()
        .ok_or("missing provisioning profile (-m)")?;
    let password = cli.password.clone().map(SecretString::new);

    Ok(SigningIdentity::load(
        cli.certificate.as_deref(),
        key,
        profile,
        cli.entitlements.as_deref(),
        password.as_ref(),
    )?)
}

fn process_macho(cli: &Cli, input: &Path) -> Result<(), Box<dyn Error>> {
    let mut macho = MachOFile::read(input)?;

    if cli.dylibs.is_empty() {
        for desc in macho.describe()? {
            println!(
                "{:>8}  {}  {}{}  {} bytes",
                desc.arch,
                if desc.is_64 { "64-bit" } else { "32-bit" },
                if desc.is_executable { "executable" } else { "library" },
                if desc.signed { ", signed" } else { "" },
                desc.size
            );
        }
        return Ok(());
    }

    let mut changed = false;
    for dylib in &cli.dylibs {
        let name = dylib.to_string_lossy();
        if macho.inject_dylib(&name, cli.weak)? {
            info!(dylib = %name, "injected");
            changed = true;
        } else {
            info!(dylib = %name, "already present");
        }
    }
    if changed {
        macho.write()?;
    }
    Ok(())
}

fn print_app_info(cli: &Cli) -> Result<(), Box<dyn Error>> {
    let input = cli.input.clone().ok_or("missing input for --info")?;

    let doc = if input.is_file() && ipa::is_zip_file(&input) {
        let temp = tempfile::Builder::new()
            .prefix("arksigning_info_")
            .tempdir()?;
        ipa::extract_archive(&input, temp.path())?;
        app_info(temp.path())?
    } else {
        app_info(&input)?
    };

    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}

fn run_bulk(cli: &Cli) -> Result<(), Box<dyn Error>> {
    let input_folder = cli
        .input_folder
        .as_deref()
        .ok_or("bulk mode requires --inputfolder")?;
    let output_folder = cli
        .output_folder
        .as_deref()
        .ok_or("bulk mode requires --outputfolder")?;
    if !input_folder.is_dir() {
        return Err(format!("input folder does not exist: {}", input_folder.display()).into());
    }

    let identity = load_identity(cli)?;

    let options = BatchOptions {
        parallel: match cli.parallel {
            Some(0) | None => None,
            Some(n) => Some(n),
        },
        zip_level: CompressionLevel::new(cli.zip_level),
        sign: sign_options(cli),
    };

    let report = run_batch(&identity, input_folder, output_folder, &options, &LogSink)?;
    if !report.all_succeeded() {
        return Err(format!(
            "{} of {} tasks failed",
            report.failed, report.total
        )
        .into());
    }
    Ok(())
}
