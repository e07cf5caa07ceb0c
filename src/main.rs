//! Item Vault - CLI
//!
//! Command-line interface for datasource packages.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use item_vault::{
    decrypt_datasource, Argon2Params, ArchiveFetcher, Datasource, DatasourceStore,
    EncryptedDatasource, EntriesConfiguration, PackageReader, PlacementRequest, SaveOutcome,
    StoreConfig,
};

#[derive(Parser)]
#[command(name = "item-vault")]
#[command(author = "Karen Tonoyan")]
#[command(version = item_vault::VERSION)]
#[command(about = "Item Vault - encrypted datasource packages")]
struct Cli {
    /// Store configuration (JSON)
    #[arg(short, long, default_value = "./item-vault.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new, empty datasource package
    Create {
        /// Datasource name
        #[arg(short, long)]
        name: String,

        /// Entry schema (JSON)
        #[arg(short, long)]
        schema: PathBuf,

        /// Password
        #[arg(short, long)]
        password: String,

        /// Output package
        #[arg(short, long)]
        out: PathBuf,
    },

    /// Show the contents of a package
    Inspect {
        /// Package path
        package: PathBuf,

        /// Password
        #[arg(short, long)]
        password: String,
    },

    /// Add one item from a JSON dump
    Add {
        /// Package path
        package: PathBuf,

        /// Item dump (JSON)
        #[arg(short, long)]
        item: PathBuf,

        /// Image file, required when the schema has images
        #[arg(long)]
        image: Option<PathBuf>,

        /// Password
        #[arg(short, long)]
        password: String,

        /// Output package
        #[arg(short, long)]
        out: PathBuf,
    },

    /// Regenerate the data key and re-encrypt everything
    Rekey {
        /// Package path
        package: PathBuf,

        /// Password
        #[arg(short, long)]
        password: String,

        /// Output package
        #[arg(short, long)]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = StoreConfig::load(&cli.config).context("loading configuration")?;

    match cli.command {
        Commands::Create {
            name,
            schema,
            password,
            out,
        } => {
            let text = std::fs::read_to_string(&schema)
                .with_context(|| format!("reading {}", schema.display()))?;
            let entries: EntriesConfiguration =
                serde_json::from_str(&text).context("parsing schema")?;

            let argon2 = Argon2Params::with_random_salt();
            let datasource = Datasource::create(name, entries, &password, argon2)?;
            let mut store = DatasourceStore::without_images(config)?;
            store.build_runtime_database(datasource)?;
            write_package(&mut store, &out).await?;
            println!("Created {}", out.display());
        }

        Commands::Inspect { package, password } => {
            let store = open_package(&package, &password, config)?;
            let snapshot = store.snapshot()?;
            println!("Datasource: {}", snapshot.name);
            println!("Items:      {}", snapshot.item_count);
            println!("Counter:    {}", snapshot.encrypted_counter);
            println!("Schema:");
            for entry in store.entries()? {
                let optional = if entry.optional { ", optional" } else { "" };
                println!("  {} ({:?}{})", entry.name, entry.kind, optional);
            }
            for (entry, tags) in &snapshot.tags {
                println!("Tags [{}]: {}", entry, tags.join(", "));
            }
            for pool in &snapshot.pools {
                let used = pool.occupied.iter().filter(|slot| **slot).count();
                println!("Pool {}: {}/{} slots", pool.name, used, pool.occupied.len());
            }
        }

        Commands::Add {
            package,
            item,
            image,
            password,
            out,
        } => {
            let mut store = open_package(&package, &password, config)?;
            let text = std::fs::read_to_string(&item)
                .with_context(|| format!("reading {}", item.display()))?;
            let image = image
                .map(|path| {
                    std::fs::read(&path).with_context(|| format!("reading {}", path.display()))
                })
                .transpose()?;

            let dumped = store.load_dumped_item(&text, image.as_deref())?;
            let request = PlacementRequest {
                runtime_id: None,
                source: dumped.data,
                images: dumped.images,
            };
            let failures = store.place_items(vec![request]).await?;
            if !failures.is_empty() {
                store.cancel_tag_registration();
                bail!("item rejected: {:?}", failures);
            }
            write_package(&mut store, &out).await?;
            println!("Added item, wrote {}", out.display());
        }

        Commands::Rekey {
            package,
            password,
            out,
        } => {
            let mut store = open_package(&package, &password, config)?;
            store.regenerate_data_key(&password)?;
            write_package(&mut store, &out).await?;
            println!("Data key regenerated, wrote {}", out.display());
        }
    }
    Ok(())
}

fn open_package(
    path: &Path,
    password: &str,
    config: StoreConfig,
) -> anyhow::Result<DatasourceStore> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let reader = PackageReader::open(&bytes)?;
    let envelope = EncryptedDatasource::from_json(&reader.data_text(&config.data_file_name)?)?;
    let datasource = decrypt_datasource(&envelope, password)?;

    let mut store = DatasourceStore::new(config, Arc::new(ArchiveFetcher::new(reader)))?;
    store.build_runtime_database(datasource)?;
    Ok(store)
}

async fn write_package(store: &mut DatasourceStore, out: &Path) -> anyhow::Result<()> {
    match store.save_all().await? {
        SaveOutcome::Saved(package) => {
            std::fs::write(out, &package.bytes)
                .with_context(|| format!("writing {}", out.display()))?;
            Ok(())
        }
        SaveOutcome::RekeyRequired { messages_to_encrypt } => {
            bail!(
                "data key exhausted ({} messages needed), run `item-vault rekey` first",
                messages_to_encrypt
            )
        }
    }
}
