// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Exercise session authorization against a real TPM.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tpm2_esys::{
    Authorization, ResourceContext, SessionContext, TpmAlgId, TpmConfig, TpmContext,
    TpmHt, TpmSe, TpmaNv, TpmaSa, TpmlPcrSelection, TpmsNvPublic, TpmsSensitiveCreate,
    TpmtPublic, TpmtSymDef,
};
use tracing::info;

/// TPM 2.0 session and resource test tool
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// TPM device, optionally prefixed with `device:`
    #[arg(long, env = "TPM2_ESYS_TCTI", global = true)]
    tcti: Option<String>,
    /// JSON connection settings; --tcti takes precedence
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the device and the handles loaded on it
    Info,
    /// Start a session and use it to create a primary key
    Session(SessionArgs),
    /// Create a storage primary key, optionally persisting it
    Primary(PrimaryArgs),
    /// Define, write, read and undefine an NV index
    Nv(NvArgs),
}

#[derive(Args)]
struct SessionArgs {
    /// Salt the session with a storage primary key
    #[arg(long)]
    salted: bool,
    /// Bind the session to the owner hierarchy
    #[arg(long)]
    bound: bool,
    /// Encrypt command and response parameters with AES-128-CFB
    #[arg(long)]
    encrypt: bool,
    /// Owner hierarchy auth value
    #[arg(long, default_value = "")]
    owner_auth: String,
}

#[derive(Args)]
struct PrimaryArgs {
    /// Create an ECC key instead of RSA
    #[arg(long)]
    ecc: bool,
    /// Persistent handle to evict the key to, e.g. 0x81000100
    #[arg(long, value_parser = parse_handle)]
    persist: Option<u32>,
}

#[derive(Args)]
struct NvArgs {
    /// NV index handle
    #[arg(long, value_parser = parse_handle, default_value = "0x01500100")]
    index: u32,
    /// Data to write, hex encoded
    #[arg(long, default_value = "74706d322d657379732d74657374")]
    data: String,
    /// Leave the index defined afterwards
    #[arg(long)]
    keep: bool,
}

fn parse_handle(s: &str) -> Result<u32, std::num::ParseIntError> {
    u32::from_str_radix(s.strip_prefix("0x").unwrap_or(s), 16)
}

fn load_config(cli: &Cli) -> Result<TpmConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&raw).context("failed to parse TPM config")?
        }
        None => TpmConfig::default(),
    };
    if cli.tcti.is_some() {
        config.tcti = cli.tcti.clone();
    }
    Ok(config)
}

fn continued(session: &SessionContext, auth: &[u8]) -> Authorization {
    session
        .with_attrs(TpmaSa::new().with_continue_session())
        .with_auth_value(auth)
        .into()
}

fn storage_template(ecc: bool) -> TpmtPublic {
    if ecc {
        TpmtPublic::ecc_storage_key()
    } else {
        TpmtPublic::rsa_storage_key()
    }
}

fn create_storage_primary(
    tpm: &mut TpmContext,
    ecc: bool,
    auth: &Authorization,
) -> Result<ResourceContext> {
    let owner = tpm.owner_handle_context();
    let (primary, _) = tpm
        .create_primary(
            &owner,
            &TpmsSensitiveCreate::default(),
            &storage_template(ecc),
            &[],
            &TpmlPcrSelection::default(),
            auth,
            &[],
        )
        .context("failed to create primary key")?;
    Ok(primary)
}

fn cmd_info(tpm: &mut TpmContext) -> Result<()> {
    println!("device: {}", tpm.device_path());
    for (label, ht) in [
        ("transient", TpmHt::Transient),
        ("persistent", TpmHt::Persistent),
        ("nv index", TpmHt::NvIndex),
    ] {
        let handles = tpm
            .get_capability_handles(ht.base_handle(), u32::MAX)
            .with_context(|| format!("failed to list {label} handles"))?;
        println!("{label} handles: {}", handles.len());
        for h in handles {
            println!("  0x{h:08x}");
        }
    }
    Ok(())
}

fn cmd_session(tpm: &mut TpmContext, args: SessionArgs) -> Result<()> {
    let owner = tpm.owner_handle_context();
    let owner_auth = args.owner_auth.as_bytes();

    let salt_key = if args.salted {
        Some(create_storage_primary(tpm, false, &Authorization::password(owner_auth))?)
    } else {
        None
    };
    let symmetric = if args.encrypt {
        TpmtSymDef::aes_128_cfb()
    } else {
        TpmtSymDef::Null
    };
    let session = tpm
        .start_auth_session(
            salt_key.as_ref(),
            args.bound.then_some(&owner),
            TpmSe::Hmac,
            symmetric,
            TpmAlgId::Sha256,
            owner_auth,
        )
        .context("failed to start session")?;
    info!(
        "started session 0x{:08x} (salted: {}, bound: {})",
        session.handle(),
        args.salted,
        session.is_bound()
    );

    let mut attrs = TpmaSa::new().with_continue_session();
    if args.encrypt {
        attrs = attrs.with_decrypt().with_encrypt();
    }
    let auth = Authorization::from(session.with_attrs(attrs).with_auth_value(owner_auth));
    let primary = create_storage_primary(tpm, false, &auth)?;
    println!(
        "created primary 0x{:08x} name {}",
        primary.handle(),
        hex::encode(primary.name().as_bytes())
    );

    // A second use checks that the nonces stayed in sync
    let second = create_storage_primary(tpm, true, &continued(&session, owner_auth))?;

    tpm.flush_context(&second)?;
    tpm.flush_context(&primary)?;
    if let Some(key) = salt_key {
        tpm.flush_context(&key)?;
    }
    tpm.flush_context(session.context())?;
    println!("session test passed");
    Ok(())
}

fn cmd_primary(tpm: &mut TpmContext, args: PrimaryArgs) -> Result<()> {
    let primary = create_storage_primary(tpm, args.ecc, &Authorization::default())?;
    println!(
        "created {} primary 0x{:08x} name {}",
        if args.ecc { "ECC" } else { "RSA" },
        primary.handle(),
        hex::encode(primary.name().as_bytes())
    );

    if let Some(handle) = args.persist {
        if TpmHt::from_handle(handle) != Some(TpmHt::Persistent) {
            bail!("0x{handle:08x} is not a persistent handle");
        }
        let owner = tpm.owner_handle_context();
        if let Ok(existing) = tpm.wrap_handle(handle) {
            info!("replacing persistent object 0x{handle:08x}");
            tpm.evict_control(&owner, &existing, handle, &Authorization::default(), &[])
                .context("failed to remove existing persistent object")?;
        }
        tpm.evict_control(&owner, &primary, handle, &Authorization::default(), &[])
            .context("failed to persist primary key")?;
        println!("persisted at 0x{handle:08x}");
    }
    tpm.flush_context(&primary)?;
    Ok(())
}

fn cmd_nv(tpm: &mut TpmContext, args: NvArgs) -> Result<()> {
    let data = hex::decode(&args.data).context("data is not valid hex")?;
    let size = u16::try_from(data.len()).context("data too large")?;
    let owner = tpm.owner_handle_context();
    let auth = b"tpm2-esys-test";

    let nv = tpm
        .nv_define_space(
            &owner,
            auth,
            &TpmsNvPublic::new(
                args.index,
                size,
                TpmaNv::new().with_auth_write().with_auth_read(),
            ),
            &Authorization::default(),
            &[],
        )
        .with_context(|| format!("failed to define NV index 0x{:08x}", args.index))?;

    let session = tpm
        .start_auth_session(
            None,
            None,
            TpmSe::Hmac,
            TpmtSymDef::aes_128_cfb(),
            TpmAlgId::Sha256,
            &[],
        )
        .context("failed to start session")?;
    let write: Authorization = session
        .with_attrs(TpmaSa::new().with_continue_session().with_decrypt())
        .with_auth_value(auth)
        .into();
    tpm.nv_write(&nv, &nv, &data, 0, &write, &[])
        .context("failed to write NV index")?;
    println!("NV name after write: {}", hex::encode(nv.name().as_bytes()));

    let read: Authorization = session
        .with_attrs(TpmaSa::new().with_continue_session().with_encrypt())
        .with_auth_value(auth)
        .into();
    let out = tpm
        .nv_read(&nv, &nv, size, 0, &read, &[])
        .context("failed to read NV index")?;
    if out != data {
        bail!("read back {} instead of {}", hex::encode(&out), args.data);
    }
    println!("read back {}", hex::encode(&out));
    tpm.flush_context(session.context())?;

    if !args.keep {
        tpm.nv_undefine_space(&owner, &nv, &Authorization::default(), &[])
            .context("failed to undefine NV index")?;
    }
    Ok(())
}

fn main() -> Result<()> {
    {
        use tracing_subscriber::{fmt, EnvFilter};
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt().with_env_filter(filter).init();
    }

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let mut tpm = TpmContext::open(&config).context("failed to open TPM")?;
    info!("using TPM at {}", tpm.device_path());

    match cli.command {
        Commands::Info => cmd_info(&mut tpm)?,
        Commands::Session(args) => cmd_session(&mut tpm, args)?,
        Commands::Primary(args) => cmd_primary(&mut tpm, args)?,
        Commands::Nv(args) => cmd_nv(&mut tpm, args)?,
    }
    tpm.close();
    Ok(())
}
