// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::{env, fs, process};

use cryptodisk::{BlockSource, CryptoDisk, ImageSource, ReadSeek};
use zeroize::{Zeroize, Zeroizing};

/// Parsed command line: disk image plus optional detached header, key file
/// and UUID filter
struct Options {
    image: PathBuf,
    header: Option<PathBuf>,
    keyfile: Option<PathBuf>,
    uuid: Option<String>,
}

fn usage() -> ! {
    eprintln!("usage: unlocktester [--header FILE] [--keyfile FILE] [--uuid UUID] IMAGE");
    process::exit(2);
}

fn parse_args() -> Options {
    let mut image = None;
    let mut header = None;
    let mut keyfile = None;
    let mut uuid = None;

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--header" => header = args.next().map(PathBuf::from).or_else(|| usage()),
            "--keyfile" => keyfile = args.next().map(PathBuf::from).or_else(|| usage()),
            "--uuid" => uuid = args.next().or_else(|| usage()),
            path if image.is_none() => image = Some(PathBuf::from(path)),
            _ => usage(),
        }
    }

    let Some(image) = image else { usage() };
    Options {
        image,
        header,
        keyfile,
        uuid,
    }
}

/// Obtains the unlock secret: raw key file bytes, or an interactive
/// passphrase bounded at the format's maximum length
fn read_secret(options: &Options, crypt: &CryptoDisk) -> Result<Zeroizing<Vec<u8>>, Box<dyn std::error::Error>> {
    if let Some(path) = &options.keyfile {
        return Ok(Zeroizing::new(fs::read(path)?));
    }

    let prompt = format!("Enter passphrase for {} ({}): ", options.image.display(), crypt.uuid());
    let mut passphrase = rpassword::prompt_password(prompt)?;
    let secret = Zeroizing::new(passphrase.as_bytes().to_vec());
    passphrase.zeroize();

    if secret.is_empty() {
        return Err("Passphrase not supplied".into());
    }
    if secret.len() > luks2::MAX_PASSPHRASE {
        return Err("Passphrase too long".into());
    }
    Ok(secret)
}

/// Decrypts the first payload sector with the freshly installed master key
/// so a wrong unlock is visible immediately
fn peek_payload(
    source: &mut ImageSource<File>,
    crypt: &CryptoDisk,
) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let sector_size = 1usize << crypt.log_sector_size;
    let mut sector = vec![0u8; sector_size];
    source.seek(SeekFrom::Start(crypt.offset_sectors << crypt.log_sector_size))?;
    source.read_exact(&mut sector)?;
    crypt.decrypt(&mut sector, 0, crypt.log_sector_size)?;
    Ok(sector)
}

/// Main entry point - probes and unlocks a LUKS2 disk image
fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let options = parse_args();

    let mut source = ImageSource::new(File::open(&options.image)?)?;
    let mut header = match &options.header {
        Some(path) => Some(File::open(path)?),
        None => None,
    };

    let mut crypt = luks2::scan(
        &mut source,
        options.uuid.as_deref(),
        false,
        header.as_mut().map(|file| file as &mut dyn ReadSeek),
    )
    .ok_or("Not a LUKS2 volume")?;
    eprintln!("LUKS2 volume: UUID={}", crypt.uuid());

    let secret = read_secret(&options, &crypt)?;
    let slot = luks2::recover_key(
        &mut source,
        &mut crypt,
        header.as_mut().map(|file| file as &mut dyn ReadSeek),
        &secret,
    )?;

    eprintln!("Slot {slot} opened");
    eprintln!(
        "Payload: {} sectors of {} bytes starting at sector {} (device: {} sectors)",
        crypt.total_sectors,
        1u64 << crypt.log_sector_size,
        crypt.offset_sectors,
        source.total_sectors(),
    );

    let sector = peek_payload(&mut source, &crypt)?;
    eprintln!("First payload bytes: {}", hex::encode(&sector[..32]));

    Ok(())
}
