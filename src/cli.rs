#[cfg(feature = "cli")]
use crate::error::{Error, Result};
#[cfg(feature = "cli")]
use crate::instance::{instances, Instance, Layout};
#[cfg(feature = "cli")]
use crate::lifecycle::{CertManager, CreateCertOptions};
#[cfg(feature = "cli")]
use crate::nssdb::NssTools;
#[cfg(feature = "cli")]
use crate::server_xml;
#[cfg(feature = "cli")]
use crate::transport::{RenewalOptions, RestConnector};
#[cfg(feature = "cli")]
use crate::types::{CertId, CertInfo, ContainerVersion};
#[cfg(feature = "cli")]
use clap::{Parser, Subcommand};
#[cfg(feature = "cli")]
use colored::Colorize;
#[cfg(feature = "cli")]
use std::path::PathBuf;

#[cfg(feature = "cli")]
#[derive(Parser)]
#[command(name = "pkictl")]
#[command(version, about = "Lifecycle management for PKI server instances", long_about = None)]
pub struct Cli {
    #[arg(short = 'U', long = "url", global = true, help = "CA server URL")]
    pub url: Option<String>,

    #[arg(long, global = true, help = "CA bundle for server verification")]
    pub ca_bundle: Option<PathBuf>,

    #[arg(long, global = true, help = "TLS client certificate (PEM)")]
    pub client_cert: Option<PathBuf>,

    #[arg(long, global = true, help = "TLS client key (PEM)")]
    pub client_key: Option<PathBuf>,

    #[arg(long, global = true, help = "REST API version")]
    pub api: Option<String>,

    #[arg(short, long, global = true, help = "Verbose output")]
    pub verbose: bool,

    #[arg(long, global = true, help = "Debug output")]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
pub enum Commands {
    #[command(subcommand, about = "Manage server instances")]
    Instance(InstanceCommand),

    #[command(subcommand, about = "Manage instance certificates")]
    Cert(CertCommand),

    #[command(subcommand, about = "Manage external certificates")]
    External(ExternalCommand),

    #[command(about = "Migrate AJP connector secrets for the deployed container")]
    MigrateSecrets {
        #[arg(help = "Instance name")]
        instance: String,

        #[arg(long, help = "Deployed container version, e.g. 9.0.31")]
        container: String,
    },
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
pub enum InstanceCommand {
    #[command(about = "List installed instances")]
    List,

    #[command(about = "Create an instance")]
    Create {
        #[arg(help = "Instance name")]
        name: String,

        #[arg(long, help = "Owning user")]
        user: Option<String>,

        #[arg(long, help = "Owning group")]
        group: Option<String>,

        #[arg(long, help = "Overwrite an existing instance")]
        force: bool,
    },

    #[command(about = "Remove an instance")]
    Remove {
        #[arg(help = "Instance name")]
        name: String,

        #[arg(long, help = "Also remove the config directory")]
        remove_conf: bool,

        #[arg(long, help = "Also remove the log directory")]
        remove_logs: bool,

        #[arg(long, help = "Ignore already-removed parts")]
        force: bool,
    },
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
pub enum CertCommand {
    #[command(about = "Generate a certificate signing request")]
    Request {
        #[arg(help = "Instance name")]
        instance: String,

        #[arg(help = "Certificate ID, e.g. ca_signing")]
        cert_id: String,

        #[arg(long, help = "Subject DN")]
        subject: String,

        #[arg(long, help = "Token holding the key")]
        token: Option<String>,

        #[arg(long, help = "Extension configuration file")]
        ext: Option<PathBuf>,
    },

    #[command(about = "Create a certificate (permanent, temporary, or renewal)")]
    Create {
        #[arg(help = "Instance name")]
        instance: String,

        #[arg(help = "Certificate ID, e.g. ca_signing")]
        cert_id: Option<String>,

        #[arg(long, help = "Serial number of the certificate being replaced")]
        serial: Option<String>,

        #[arg(long, help = "Create a short-lived temporary certificate")]
        temp: bool,

        #[arg(long, help = "Request renewal from the CA")]
        renew: bool,

        #[arg(long, help = "Output certificate path")]
        output: Option<PathBuf>,

        #[arg(long, help = "Token holding the signing key")]
        token: Option<String>,

        #[arg(long, help = "Issuer certificate nickname")]
        issuer: Option<String>,

        #[arg(long, help = "Extension configuration file")]
        ext: Option<PathBuf>,

        #[arg(long, help = "CA agent username")]
        username: Option<String>,

        #[arg(long, help = "CA agent password")]
        password: Option<String>,

        #[arg(long, help = "Client certificate nickname for CA authentication")]
        client_nickname: Option<String>,

        #[arg(long, help = "Client NSS database directory")]
        client_nssdb: Option<PathBuf>,

        #[arg(long, help = "Client NSS database password")]
        client_nssdb_password: Option<String>,

        #[arg(long, help = "File containing the client NSS database password")]
        client_nssdb_password_file: Option<PathBuf>,
    },

    #[command(about = "Import a certificate into the security module")]
    Import {
        #[arg(help = "Instance name")]
        instance: String,

        #[arg(help = "Certificate ID, e.g. ca_signing")]
        cert_id: Option<String>,

        #[arg(long, help = "Certificate file (defaults to the staged cert)")]
        input: Option<PathBuf>,

        #[arg(long, help = "Target token")]
        token: Option<String>,

        #[arg(long, help = "Target nickname")]
        nickname: Option<String>,
    },

    #[command(about = "Delete a certificate from the security module")]
    Del {
        #[arg(help = "Instance name")]
        instance: String,

        #[arg(help = "Certificate ID, e.g. ca_signing")]
        cert_id: String,

        #[arg(long, help = "Also remove the private key")]
        remove_key: bool,
    },

    #[command(about = "Verify a certificate against the security module")]
    Verify {
        #[arg(help = "Instance name")]
        instance: String,

        #[arg(help = "Certificate file")]
        cert_file: PathBuf,

        #[arg(
            short,
            long,
            default_value = "pretty",
            help = "Output format: pretty or json"
        )]
        format: String,
    },
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
pub enum ExternalCommand {
    #[command(about = "List external certificates")]
    List {
        #[arg(help = "Instance name")]
        instance: String,
    },

    #[command(about = "Register an external certificate")]
    Add {
        #[arg(help = "Instance name")]
        instance: String,

        #[arg(help = "Certificate nickname")]
        nickname: String,

        #[arg(long, help = "Token holding the certificate")]
        token: Option<String>,
    },

    #[command(about = "Unregister an external certificate")]
    Del {
        #[arg(help = "Instance name")]
        instance: String,

        #[arg(help = "Certificate nickname")]
        nickname: String,

        #[arg(long, help = "Token holding the certificate")]
        token: Option<String>,
    },

    #[command(about = "Import a PKCS #12 bundle for every external certificate")]
    Export {
        #[arg(help = "Instance name")]
        instance: String,

        #[arg(long, help = "PKCS #12 bundle")]
        pkcs12_file: PathBuf,

        #[arg(long, help = "File containing the bundle password")]
        pkcs12_password_file: PathBuf,

        #[arg(long, help = "Preserve existing token contents")]
        append: bool,
    },
}

#[cfg(feature = "cli")]
pub fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.debug);

    match &cli.command {
        Commands::Instance(command) => run_instance(command),
        Commands::Cert(command) => run_cert(&cli, command),
        Commands::External(command) => run_external(command),
        Commands::MigrateSecrets {
            instance,
            container,
        } => {
            let instance = load_instance(instance)?;
            let container: ContainerVersion = container.parse()?;
            server_xml::configure_connectors(&instance, &container)?;

            println!("{}", "Connector secrets migrated.".green().bold());
            Ok(())
        }
    }
}

#[cfg(feature = "cli")]
fn init_logging(verbose: bool, debug: bool) {
    let level = if debug {
        log::LevelFilter::Debug
    } else if verbose {
        log::LevelFilter::Info
    } else {
        log::LevelFilter::Warn
    };

    env_logger::Builder::new().filter_level(level).init();
}

#[cfg(feature = "cli")]
fn load_instance(name: &str) -> Result<Instance> {
    let mut instance = Instance::new(name);

    if !instance.base_dir().exists() {
        return Err(Error::NotFound(format!("Invalid instance: {}", name)));
    }

    instance.load()?;
    Ok(instance)
}

#[cfg(feature = "cli")]
fn connector(cli: &Cli) -> Result<RestConnector> {
    let url = cli.url.as_deref().unwrap_or("https://localhost:8443");
    let mut connector = RestConnector::from_url(url, cli.ca_bundle.clone())?;

    if let (Some(cert), Some(key)) = (&cli.client_cert, &cli.client_key) {
        connector = connector.with_client_files(cert.clone(), key.clone());
    }
    if let Some(api) = &cli.api {
        connector = connector.with_api_version(api);
    }

    Ok(connector)
}

#[cfg(feature = "cli")]
fn run_instance(command: &InstanceCommand) -> Result<()> {
    match command {
        InstanceCommand::List => {
            let mut listed = instances(&Layout::default())?;
            listed.sort();

            for instance in &listed {
                println!(
                    "{} (version {}, user {})",
                    instance.name.cyan(),
                    instance.version,
                    instance.user
                );
            }
            Ok(())
        }

        InstanceCommand::Create {
            name,
            user,
            group,
            force,
        } => {
            let mut instance = Instance::new(name.as_str());
            if let Some(user) = user {
                instance.user = user.clone();
            }
            if let Some(group) = group {
                instance.group = group.clone();
            }

            instance.create(*force)?;

            println!("{}", "Instance created successfully!".green().bold());
            println!("  {}: {}", "Base".cyan(), instance.base_dir().display());
            println!("  {}: {}", "Config".cyan(), instance.conf_dir().display());
            Ok(())
        }

        InstanceCommand::Remove {
            name,
            remove_conf,
            remove_logs,
            force,
        } => {
            let instance = Instance::new(name.as_str());
            instance.remove(*remove_conf, *remove_logs, *force)?;

            println!("{}", "Instance removed.".green().bold());
            Ok(())
        }
    }
}

#[cfg(feature = "cli")]
fn run_cert(cli: &Cli, command: &CertCommand) -> Result<()> {
    match command {
        CertCommand::Request {
            instance,
            cert_id,
            subject,
            token,
            ext,
        } => {
            let instance = load_instance(instance)?;
            let tools = NssTools::open(&instance)?;
            let manager = CertManager::new(&instance, &tools, &tools);

            let cert_id: CertId = cert_id.parse()?;
            manager.request_cert(&cert_id, subject, token.as_deref(), ext.as_deref())?;

            println!("{}", "CSR generated successfully!".green().bold());
            println!(
                "  {}: {}",
                "CSR".cyan(),
                instance.csr_file(cert_id.as_str()).display()
            );
            Ok(())
        }

        CertCommand::Create {
            instance,
            cert_id,
            serial,
            temp,
            renew,
            output,
            token,
            issuer,
            ext,
            username,
            password,
            client_nickname,
            client_nssdb,
            client_nssdb_password,
            client_nssdb_password_file,
        } => {
            let instance = load_instance(instance)?;
            let tools = NssTools::open(&instance)?;
            let manager = CertManager::new(&instance, &tools, &tools);

            let options = CreateCertOptions {
                cert_id: cert_id.as_deref().map(str::parse).transpose()?,
                serial: serial.clone(),
                temp_cert: *temp,
                renew: *renew,
                rekey: false,
                output: output.clone(),
                token: token.clone(),
                issuer: issuer.clone(),
                ext_conf: ext.clone(),
                auth: RenewalOptions {
                    username: username.clone(),
                    password: password.clone(),
                    client_nickname: client_nickname.clone(),
                    client_nssdb: client_nssdb.clone(),
                    client_nssdb_password: client_nssdb_password.clone(),
                    client_nssdb_password_file: client_nssdb_password_file.clone(),
                },
            };

            manager.create_cert(&options, &connector(cli)?)?;

            println!("{}", "Certificate created successfully!".green().bold());
            Ok(())
        }

        CertCommand::Import {
            instance,
            cert_id,
            input,
            token,
            nickname,
        } => {
            let instance = load_instance(instance)?;
            let tools = NssTools::open(&instance)?;
            let manager = CertManager::new(&instance, &tools, &tools);

            let cert_id: Option<CertId> = cert_id.as_deref().map(str::parse).transpose()?;
            manager.import_cert(
                cert_id.as_ref(),
                input.as_deref(),
                token.as_deref(),
                nickname.as_deref(),
            )?;

            println!("{}", "Certificate imported successfully!".green().bold());
            Ok(())
        }

        CertCommand::Del {
            instance,
            cert_id,
            remove_key,
        } => {
            let instance = load_instance(instance)?;
            let tools = NssTools::open(&instance)?;
            let manager = CertManager::new(&instance, &tools, &tools);

            manager.delete_cert(&cert_id.parse()?, *remove_key)?;

            println!("{}", "Certificate deleted.".green().bold());
            Ok(())
        }

        CertCommand::Verify {
            instance,
            cert_file,
            format,
        } => {
            let instance = load_instance(instance)?;
            let tools = NssTools::open(&instance)?;
            let manager = CertManager::new(&instance, &tools, &tools);

            let data = std::fs::read(cert_file)?;
            manager.verify_cert(&data)?;

            match format.to_lowercase().as_str() {
                "pretty" => {
                    println!("{}", "Certificate is valid.".green().bold());
                    if let Ok(info) = CertInfo::from_pem(&data) {
                        println!("  {}: {}", "Subject".cyan(), info.subject);
                        println!("  {}: {}", "Serial".cyan(), info.serial);
                        println!("  {}: {}", "Expires".cyan(), info.not_after);
                    }
                }
                #[cfg(feature = "json")]
                "json" => {
                    let info = CertInfo::from_pem(&data)?;
                    println!("{}", serde_json::to_string_pretty(&info)?);
                }
                _ => {
                    return Err(Error::Config(format!("Invalid format: {}", format)));
                }
            }
            Ok(())
        }
    }
}

#[cfg(feature = "cli")]
fn run_external(command: &ExternalCommand) -> Result<()> {
    match command {
        ExternalCommand::List { instance } => {
            let instance = load_instance(instance)?;

            for cert in instance.external_certs() {
                match &cert.token {
                    Some(token) => println!("{} ({})", cert.nickname.cyan(), token),
                    None => println!("{}", cert.nickname.cyan()),
                }
            }
            Ok(())
        }

        ExternalCommand::Add {
            instance,
            nickname,
            token,
        } => {
            let mut instance = load_instance(instance)?;
            instance.add_external_cert(nickname, token.as_deref());
            instance.store_external_certs()?;

            println!("{}", "External certificate registered.".green().bold());
            Ok(())
        }

        ExternalCommand::Del {
            instance,
            nickname,
            token,
        } => {
            let mut instance = load_instance(instance)?;
            instance.delete_external_cert(nickname, token.as_deref());
            instance.store_external_certs()?;

            println!("{}", "External certificate unregistered.".green().bold());
            Ok(())
        }

        ExternalCommand::Export {
            instance,
            pkcs12_file,
            pkcs12_password_file,
            append,
        } => {
            let instance = load_instance(instance)?;
            let tools = NssTools::open(&instance)?;
            let manager = CertManager::new(&instance, &tools, &tools);

            manager.export_external_certs(pkcs12_file, pkcs12_password_file, *append)?;

            println!("{}", "External certificates exported.".green().bold());
            Ok(())
        }
    }
}
