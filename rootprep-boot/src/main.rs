#[macro_use] extern crate librootprep;

extern crate clap;

use std::process::exit;

use clap::AppSettings::*;
use clap::{App, Arg, ArgMatches, SubCommand};

use librootprep::{
    format_error, set_verbose, sha256_of_keyfile, tpm_get_random, tpm_seal, Activation,
    BootConfig, CommandLine, DmSetup, KernelKeyring, PartitionMetadata, PcrPolicy, Result,
};

fn main() {
    if CommandLine::verbose() {
        set_verbose(true);
    }

    let app = App::new("rootprep-boot")
        .about("Prepare and authenticate the root filesystem block device")
        .settings(&[ArgRequiredElseHelp, DisableHelpSubcommand, DisableVersion, DeriveDisplayOrder])
        .arg(Arg::with_name("verbose")
            .short("v")
            .long("verbose")
            .help("Print progress details"))

        .subcommand(SubCommand::with_name("setup")
            .about("Activate the rootfs device stack described by the signed partition metadata")
            .arg(Arg::with_name("config")
                .long("config")
                .takes_value(true)
                .help("Path to boot configuration file"))
            .arg(Arg::with_name("device")
                .long("device")
                .takes_value(true)
                .help("Backing block device of the rootfs"))
            .arg(Arg::with_name("keyfile")
                .long("keyfile")
                .takes_value(true)
                .help("PEM public keyfile for metadata verification"))
            .arg(Arg::with_name("sealed-key")
                .long("sealed-key")
                .takes_value(true)
                .help("Path to the TPM sealed volume key"))
            .arg(Arg::with_name("pcrs")
                .long("pcrs")
                .takes_value(true)
                .help("PCR selection, e.g. sha256:0,4,7"))
            .arg(Arg::with_name("keyring-key")
                .long("keyring-key")
                .takes_value(true)
                .help("Kernel keyring description of the volume key")))

        .subcommand(SubCommand::with_name("seal")
            .about("Generate a fresh volume key and seal it to the TPM")
            .arg(Arg::with_name("keyfile")
                .long("keyfile")
                .required(true)
                .takes_value(true)
                .help("PEM public keyfile the sealed key is bound to"))
            .arg(Arg::with_name("output")
                .long("output")
                .required(true)
                .takes_value(true)
                .help("Where to write the sealed blob"))
            .arg(Arg::with_name("pcrs")
                .long("pcrs")
                .required(true)
                .takes_value(true)
                .help("PCR selection, e.g. sha256:0,4,7")))

        .subcommand(SubCommand::with_name("inspect")
            .about("Authenticate and print the partition metadata")
            .arg(Arg::with_name("device")
                .long("device")
                .required(true)
                .takes_value(true)
                .help("Backing block device or image file"))
            .arg(Arg::with_name("keyfile")
                .long("keyfile")
                .required(true)
                .takes_value(true)
                .help("PEM public keyfile for metadata verification")));

    let matches = app.get_matches();
    if matches.is_present("verbose") {
        set_verbose(true);
    }

    let result = match matches.subcommand() {
        ("setup", Some(m)) => setup(m),
        ("seal", Some(m)) => seal(m),
        ("inspect", Some(m)) => inspect(m),
        _ => Ok(()),
    };

    if let Err(ref e) = result {
        eprintln!("Error: {}", format_error(e));
        exit(1);
    }
}

fn load_config(m: &ArgMatches) -> Result<BootConfig> {
    let mut config = match m.value_of("config") {
        Some(path) => BootConfig::load(path)?,
        None => BootConfig::load_default()?,
    };
    if let Some(device) = m.value_of("device") {
        config.set_device(device);
    } else if let Some(device) = CommandLine::device() {
        config.set_device(device);
    }
    if let Some(keyfile) = m.value_of("keyfile") {
        config.set_keyfile(keyfile);
    }
    if let Some(blob) = m.value_of("sealed-key") {
        config.set_sealed_key(blob);
    }
    if let Some(pcrs) = m.value_of("pcrs") {
        config.set_pcrs(pcrs);
    }
    if let Some(description) = m.value_of("keyring-key") {
        config.set_keyring_key(description);
    }
    Ok(config)
}

/// Run the full activation and print the path of the device the real init
/// should mount as the root filesystem.
fn setup(m: &ArgMatches) -> Result<()> {
    let config = load_config(m)?;
    let device = config.device()?.to_path_buf();
    let keyfile = config.keyfile()?.to_path_buf();
    let key_source = config.key_source()?;

    let dm = DmSetup;
    let keyring = KernelKeyring;
    let activation = Activation::new(&dm, &keyring);
    let mut meta = PartitionMetadata::new(device);
    let top = activation.run(&mut meta, &keyfile, key_source.as_ref())?;
    println!("{}", top.display());
    Ok(())
}

fn seal(m: &ArgMatches) -> Result<()> {
    let keyfile = m.value_of("keyfile").unwrap();
    let output = m.value_of("output").unwrap();
    let policy = PcrPolicy::parse(m.value_of("pcrs").unwrap())?;

    let digest = sha256_of_keyfile(keyfile)?;
    let mut key = tpm_get_random(32)?;
    let result = tpm_seal(&digest, &policy, &key);
    for b in key.iter_mut() {
        *b = 0;
    }
    let blob = result?;
    blob.write_to(output)?;
    info!("Sealed volume key written to {}", output);
    Ok(())
}

fn inspect(m: &ArgMatches) -> Result<()> {
    let device = m.value_of("device").unwrap();
    let keyfile = m.value_of("keyfile").unwrap();

    let mut meta = PartitionMetadata::new(device);
    meta.load_and_verify(keyfile, &KernelKeyring)?;

    println!("device:  {}", meta.device_path().display());
    println!("fs-type: {}", meta.fs_type());
    println!("mount:   {}", if meta.is_read_only() { "ro" } else { "rw" });
    println!("mode:    {}", meta.mode().label());
    if !meta.dm_table_verint().is_empty() {
        println!("verint:  {}", meta.dm_table_verint());
    }
    if !meta.dm_table_crypt().is_empty() {
        println!("crypt:   {}", meta.dm_table_crypt());
    }
    if meta.dm_volume_data_bytes() > 0 {
        println!("volume:  {} bytes", meta.dm_volume_data_bytes());
    }
    Ok(())
}
