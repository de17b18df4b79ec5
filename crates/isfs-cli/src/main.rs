#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use isfs_block::{
    BlockSource, ByteDevice, FileByteDevice, NandImageSource, RawImageSource, RedirectedSource,
};
use isfs_core::{DEFAULT_VOLUME_NAMES, EccPolicy, RegistryOptions, VolumeRegistry, Whence};
use isfs_crypto::{OtpKeySet, SoftAes128Cbc};
use isfs_ondisk::FstEntry;
use isfs_types::{PAGE_SIZE, PAGE_SPARE_SIZE};
use serde::Serialize;
use std::env;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

const NAND_PAGE_STRIDE: u64 = (PAGE_SIZE + PAGE_SPARE_SIZE) as u64;

/// Options shared by every subcommand.
struct CliOptions {
    json: bool,
    strict_ecc: bool,
    volume: String,
    redirect: Option<u8>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut positional = Vec::new();
    let mut options = CliOptions {
        json: false,
        strict_ecc: false,
        volume: DEFAULT_VOLUME_NAMES[0].to_owned(),
        redirect: None,
    };

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--json" => options.json = true,
            "--strict-ecc" => options.strict_ecc = true,
            "--volume" => {
                let Some(name) = args.next() else {
                    bail!("--volume requires a name argument");
                };
                options.volume = name;
            }
            "--redirect" => {
                let Some(index) = args.next() else {
                    bail!("--redirect requires a bank index argument");
                };
                options.redirect = Some(index.parse().context("bank index must be 0-255")?);
            }
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            flag if flag.starts_with("--") => bail!("unknown flag: {flag}"),
            _ => positional.push(arg),
        }
    }

    let Some((command, rest)) = positional.split_first() else {
        print_usage();
        return Ok(());
    };

    match (command.as_str(), rest) {
        ("inspect", [image, keyfile]) => inspect(image, keyfile, &options),
        ("ls", [image, keyfile, path]) => ls(image, keyfile, path, &options),
        ("stat", [image, keyfile, path]) => stat(image, keyfile, path, &options),
        ("cat", [image, keyfile, path]) => cat(image, keyfile, path, &options),
        ("extract", [image, keyfile, path, out]) => extract(image, keyfile, path, out, &options),
        ("help", _) => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command or wrong arguments: {command}")
        }
    }
}

fn print_usage() {
    println!("isfs-cli\n");
    println!("USAGE:");
    println!("  isfs-cli inspect <image> <keyfile>");
    println!("  isfs-cli ls      <image> <keyfile> <path>");
    println!("  isfs-cli stat    <image> <keyfile> <path>");
    println!("  isfs-cli cat     <image> <keyfile> <path>");
    println!("  isfs-cli extract <image> <keyfile> <path> <output-file>");
    println!();
    println!("OPTIONS:");
    println!("  --json             machine-readable output (inspect/ls/stat)");
    println!("  --strict-ecc       fail reads on uncorrectable pages");
    println!(
        "  --volume <name>    volume name for paths (default: {})",
        DEFAULT_VOLUME_NAMES[0]
    );
    println!("  --redirect <n>     treat the image as an external medium and");
    println!("                     open redirected bank <n> via its MBR");
    println!();
    println!("Paths take the form <volume>:/dir/file, e.g. slc:/sys/config.dat");
}

/// Bind the image file to a page source. The dump format is inferred
/// from the file length: a multiple of the 2112-byte page-plus-OOB
/// stride reads as a NAND dump with spare data, a multiple of the plain
/// page size as a spare-less dump.
fn open_source(image: &str, options: &CliOptions) -> Result<Arc<dyn BlockSource>> {
    let device = FileByteDevice::open(image)
        .with_context(|| format!("failed to open image {image}"))?;

    if let Some(index) = options.redirect {
        let source = RedirectedSource::probe(device, index)
            .with_context(|| format!("no redirect partition in {image}"))?;
        return Ok(Arc::new(source));
    }

    let len = device.len_bytes();
    if len % NAND_PAGE_STRIDE == 0 {
        let source = NandImageSource::new(device).context("bad NAND image")?;
        Ok(Arc::new(source))
    } else if len % PAGE_SIZE as u64 == 0 {
        let source = RawImageSource::new(device).context("bad raw image")?;
        Ok(Arc::new(source))
    } else {
        bail!("image length {len} matches neither the 2112-byte nor the 2048-byte page stride")
    }
}

fn mount(image: &str, keyfile: &str, options: &CliOptions) -> Result<VolumeRegistry> {
    let key_bytes = fs::read(keyfile)
        .with_context(|| format!("failed to read key file {keyfile}"))?;
    let keys = OtpKeySet::from_bytes(&key_bytes).context("bad key file")?;

    let mut registry = VolumeRegistry::new(
        keys,
        Arc::new(SoftAes128Cbc),
        RegistryOptions {
            ecc_policy: if options.strict_ecc {
                EccPolicy::Strict
            } else {
                EccPolicy::BestEffort
            },
        },
    );
    let id = registry.add_volume(&options.volume, open_source(image, options)?);
    registry
        .mount(id)
        .with_context(|| format!("failed to mount {image}"))?;
    Ok(registry)
}

#[derive(Debug, Serialize)]
struct EntryOutput {
    name: String,
    mode: String,
    size: u32,
    uid: u16,
    gid: u16,
    attr: u8,
}

impl EntryOutput {
    fn from_entry(entry: &FstEntry) -> Self {
        Self {
            name: entry.name_str(),
            mode: entry.mode_string(),
            size: entry.size,
            uid: entry.uid,
            gid: entry.gid,
            attr: entry.attr,
        }
    }

    fn print_line(&self) {
        println!(
            "{} {:04x}:{:04x} {:>10}  {}",
            self.mode, self.uid, self.gid, self.size, self.name
        );
    }
}

fn inspect(image: &str, keyfile: &str, options: &CliOptions) -> Result<()> {
    let registry = mount(image, keyfile, options)?;
    let status = registry.status(isfs_types::VolumeId(0))?;
    if options.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&status).context("serialize status")?
        );
    } else {
        println!("volume: {}", status.name);
        println!("mounted: {}", status.mounted);
        if let Some(version) = status.version {
            println!("version: {version}");
        }
        if let Some(generation) = status.generation {
            println!("generation: {}", generation.0);
        }
        if let Some(slot) = status.slot_page {
            println!("superblock_page: {slot:#x}");
        }
    }
    Ok(())
}

fn ls(image: &str, keyfile: &str, path: &str, options: &CliOptions) -> Result<()> {
    let registry = mount(image, keyfile, options)?;
    let mut dir = registry
        .diropen(path)
        .with_context(|| format!("failed to open directory {path}"))?;

    let mut entries = Vec::new();
    while let Some(entry) = dir.read().context("directory read failed")? {
        entries.push(EntryOutput::from_entry(&entry));
    }

    if options.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&entries).context("serialize entries")?
        );
    } else {
        for entry in &entries {
            entry.print_line();
        }
    }
    Ok(())
}

fn stat(image: &str, keyfile: &str, path: &str, options: &CliOptions) -> Result<()> {
    let registry = mount(image, keyfile, options)?;
    let entry = registry
        .stat(path)
        .with_context(|| format!("failed to stat {path}"))?;
    let output = EntryOutput::from_entry(&entry);
    if options.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize entry")?
        );
    } else {
        output.print_line();
    }
    Ok(())
}

fn cat(image: &str, keyfile: &str, path: &str, options: &CliOptions) -> Result<()> {
    let registry = mount(image, keyfile, options)?;
    let mut file = registry
        .open(path)
        .with_context(|| format!("failed to open {path}"))?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    copy_file(&mut file, &mut out).with_context(|| format!("read of {path} failed"))?;
    out.flush()?;
    Ok(())
}

fn extract(image: &str, keyfile: &str, path: &str, out: &str, options: &CliOptions) -> Result<()> {
    let registry = mount(image, keyfile, options)?;
    let mut file = registry
        .open(path)
        .with_context(|| format!("failed to open {path}"))?;

    let mut output = fs::File::create(Path::new(out))
        .with_context(|| format!("failed to create {out}"))?;
    let written = copy_file(&mut file, &mut output)
        .with_context(|| format!("read of {path} failed"))?;
    output.flush()?;
    eprintln!("extracted {written} bytes to {out}");
    Ok(())
}

/// Stream a file to a writer in cluster-group-sized chunks, returning the
/// byte count. Avoids buffering whole files, which can span megabytes.
fn copy_file(file: &mut isfs_core::FileHandle, out: &mut impl Write) -> Result<u64> {
    file.seek(0, Whence::Set)?;
    let mut chunk = vec![0u8; isfs_types::CLUSTER_BYTES];
    let mut written = 0u64;
    loop {
        let got = file.read(&mut chunk)?;
        if got == 0 {
            break;
        }
        out.write_all(&chunk[..got])?;
        written += got as u64;
    }
    Ok(written)
}
