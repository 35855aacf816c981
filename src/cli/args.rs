//! Command-line argument parsing

use crate::config::ConfigOverrides;
use crate::copier::CopyOptions;
use crate::error::Result;
use crate::sync::SyncJob;
use crate::transport::{AuthContext, Credentials, TlsVerify};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "docker-image-sync")]
#[command(about = "Synchronize container images between registries and local directories")]
#[command(version, author)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Timeout for the whole command in seconds
    #[arg(long = "command-timeout", global = true, value_name = "SECONDS")]
    pub command_timeout: Option<u64>,

    /// Use OS instead of the running OS when choosing images
    #[arg(long = "override-os", global = true, value_name = "OS")]
    pub override_os: Option<String>,

    /// Use ARCH instead of the architecture of the machine when choosing images
    #[arg(long = "override-arch", global = true, value_name = "ARCH")]
    pub override_arch: Option<String>,

    #[arg(long = "verbose", short = 'v', global = true, help = "Enable verbose output")]
    pub verbose: bool,

    #[arg(long = "quiet", short = 'q', global = true, help = "Only print errors")]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Synchronize one or more images from one location to another
    Sync(SyncArgs),
    /// Copy an image from one location to another
    Copy(CopyArgs),
    /// List tags in the repository specified by IMAGE
    ListTags(ListTagsArgs),
}

/// Source and destination options shared by `sync` and `copy`
#[derive(ClapArgs, Debug)]
pub struct ImageOptions {
    /// Do not copy signatures from SOURCE images
    #[arg(long = "remove-signatures")]
    pub remove_signatures: bool,

    /// Sign the image using a GPG key with the specified FINGERPRINT
    #[arg(long = "sign-by", value_name = "FINGERPRINT")]
    pub sign_by: Option<String>,

    /// Number of times to retry a failed image copy
    #[arg(long = "retry-times", value_name = "N")]
    pub retry_times: Option<u32>,

    /// Use USERNAME[:PASSWORD] for accessing the source registry
    #[arg(long = "src-creds", value_name = "USERNAME[:PASSWORD]")]
    pub src_creds: Option<String>,

    /// Use certificates at PATH (*.crt) to connect to the source registry
    #[arg(long = "src-cert-dir", value_name = "PATH")]
    pub src_cert_dir: Option<PathBuf>,

    /// Require HTTPS and verify certificates when talking to the source registry
    #[arg(long = "src-tls-verify", value_name = "BOOL", num_args = 0..=1, default_missing_value = "true")]
    pub src_tls_verify: Option<bool>,

    /// Use USERNAME[:PASSWORD] for accessing the destination registry
    #[arg(long = "dest-creds", value_name = "USERNAME[:PASSWORD]")]
    pub dest_creds: Option<String>,

    /// Use certificates at PATH (*.crt) to connect to the destination registry
    #[arg(long = "dest-cert-dir", value_name = "PATH")]
    pub dest_cert_dir: Option<PathBuf>,

    /// Require HTTPS and verify certificates when talking to the destination registry
    #[arg(long = "dest-tls-verify", value_name = "BOOL", num_args = 0..=1, default_missing_value = "true")]
    pub dest_tls_verify: Option<bool>,
}

#[derive(ClapArgs, Debug)]
pub struct SyncArgs {
    /// SOURCE transport type
    #[arg(long = "src", short = 's', value_name = "TRANSPORT")]
    pub source_transport: String,

    /// DESTINATION transport type
    #[arg(long = "dest", short = 'd', value_name = "TRANSPORT")]
    pub destination_transport: String,

    /// Images at DESTINATION are prefixed using the full source image path as scope
    #[arg(long = "scoped")]
    pub scoped: bool,

    #[command(flatten)]
    pub image: ImageOptions,

    /// Source repository, directory or YAML file
    pub source: String,

    /// Destination registry namespace or directory
    pub destination: String,
}

#[derive(ClapArgs, Debug)]
pub struct CopyArgs {
    #[command(flatten)]
    pub image: ImageOptions,

    /// Source image, e.g. docker://busybox:latest or dir:/tmp/busybox
    #[arg(value_name = "SOURCE-IMAGE")]
    pub source: String,

    /// Destination image, e.g. docker://mirror.local/busybox:latest
    #[arg(value_name = "DESTINATION-IMAGE")]
    pub destination: String,
}

#[derive(ClapArgs, Debug)]
pub struct ListTagsArgs {
    /// Use USERNAME[:PASSWORD] for accessing the registry
    #[arg(long = "creds", value_name = "USERNAME[:PASSWORD]")]
    pub creds: Option<String>,

    /// Use certificates at PATH (*.crt) to connect to the registry
    #[arg(long = "cert-dir", value_name = "PATH")]
    pub cert_dir: Option<PathBuf>,

    /// Require HTTPS and verify certificates when talking to the registry
    #[arg(long = "tls-verify", value_name = "BOOL", num_args = 0..=1, default_missing_value = "true")]
    pub tls_verify: Option<bool>,

    /// Number of times to retry a failed listing
    #[arg(long = "retry-times", value_name = "N")]
    pub retry_times: Option<u32>,

    /// Repository to list, e.g. docker://registry.example.com/team/app
    #[arg(value_name = "IMAGE")]
    pub image: String,
}

impl Args {
    pub fn parse_args() -> Self {
        Args::parse()
    }

    /// Configuration values given as flags
    pub fn overrides(&self) -> ConfigOverrides {
        let retry_times = match &self.command {
            Command::Sync(sync) => sync.image.retry_times,
            Command::Copy(copy) => copy.image.retry_times,
            Command::ListTags(list) => list.retry_times,
        };

        ConfigOverrides {
            retry_times,
            command_timeout: self.command_timeout.map(Duration::from_secs),
            verbose: self.verbose,
            quiet: self.quiet,
            os: self.override_os.clone(),
            architecture: self.override_arch.clone(),
        }
    }
}

impl ImageOptions {
    pub fn source_auth(&self) -> Result<AuthContext> {
        auth_context(self.src_creds.as_deref(), self.src_cert_dir.clone(), self.src_tls_verify)
    }

    pub fn destination_auth(&self) -> Result<AuthContext> {
        auth_context(self.dest_creds.as_deref(), self.dest_cert_dir.clone(), self.dest_tls_verify)
    }

    pub fn copy_options(&self) -> Result<CopyOptions> {
        Ok(CopyOptions {
            remove_signatures: self.remove_signatures,
            sign_by: self.sign_by.clone(),
            source_auth: Arc::new(self.source_auth()?),
            destination_auth: Arc::new(self.destination_auth()?),
        })
    }
}

impl SyncArgs {
    /// Build the job; `retry_times` comes from the merged configuration
    pub fn to_job(&self, retry_times: u32) -> Result<SyncJob> {
        Ok(SyncJob::new(
            self.source_transport.as_str(),
            self.destination_transport.as_str(),
            self.source.as_str(),
            self.destination.as_str(),
        )
        .with_scoped(self.scoped)
        .with_remove_signatures(self.image.remove_signatures)
        .with_sign_by(self.image.sign_by.clone())
        .with_retry_times(retry_times)
        .with_source_auth(self.image.source_auth()?)
        .with_destination_auth(self.image.destination_auth()?))
    }
}

impl ListTagsArgs {
    pub fn auth(&self) -> Result<AuthContext> {
        auth_context(self.creds.as_deref(), self.cert_dir.clone(), self.tls_verify)
    }
}

fn auth_context(creds: Option<&str>, cert_dir: Option<PathBuf>, tls_verify: Option<bool>) -> Result<AuthContext> {
    let credentials = creds.map(Credentials::parse).transpose()?;
    Ok(AuthContext::anonymous()
        .with_credentials(credentials)
        .with_cert_dir(cert_dir)
        .with_tls_verify(TlsVerify::from_flag(tls_verify)))
}
