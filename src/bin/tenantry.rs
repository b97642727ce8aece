use clap::{ArgAction, Parser, Subcommand};
use tenantry::broker::{Broker, PgBroker};
use tenantry::directory::PgTenantDirectory;
use tenantry::{Config, PartitionLocator, SchemaConfig, SchemaManager, SchemaPlan};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tenantry", version, about = "Tenantry admin CLI")]
struct Cli {
    /// Postgres connection string. Falls back to TENANTRY_DATABASE_URL, then DATABASE_URL.
    #[arg(long)]
    database_url: Option<String>,

    /// Schema holding the directory, lookup index and broker tables
    #[arg(long, default_value = "public")]
    schema: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show planned DDL changes without applying
    SchemaPlan {
        /// Tenant partitions to include (repeatable)
        #[arg(long = "partition", action = ArgAction::Append)]
        partitions: Vec<String>,
    },

    /// Apply DDL changes (create schemas/tables/indexes as needed)
    SchemaSync {
        /// Tenant partitions to include (repeatable)
        #[arg(long = "partition", action = ArgAction::Append)]
        partitions: Vec<String>,

        /// Also provision every partition recorded in the tenant directory
        #[arg(long)]
        all_tenants: bool,
    },

    /// List tenants in the directory, oldest first
    Tenants,

    /// List dead-lettered messages for a queue
    DeadLetters {
        /// Source queue or dead-letter queue name
        #[arg(long)]
        queue: String,

        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> tenantry::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if let Some(url) = cli.database_url {
        config.database.url = url;
    }
    if config.database.url.trim().is_empty() {
        eprintln!("error: --database-url or env DATABASE_URL is required");
        std::process::exit(2);
    }

    let pool = config.database.connect_pool().await?;
    let manager = SchemaManager::new(pool.clone());

    match cli.command {
        Commands::SchemaPlan { partitions } => {
            let schema = schema_config(&cli.schema, &partitions)?;
            let plan = manager.plan(&schema).await?;
            print_plan(&plan);
        }
        Commands::SchemaSync {
            partitions,
            all_tenants,
        } => {
            let mut schema = schema_config(&cli.schema, &partitions)?;
            let plan = manager.sync(&schema).await?;
            report_applied(&plan);
            if all_tenants {
                let directory = PgTenantDirectory::with_schema(pool.clone(), &cli.schema);
                schema.partitions = directory
                    .list()
                    .await?
                    .into_iter()
                    .map(|t| t.partition().clone())
                    .collect();
                let plan = manager.sync(&schema).await?;
                report_applied(&plan);
            }
        }
        Commands::Tenants => {
            let directory = PgTenantDirectory::with_schema(pool, &cli.schema);
            let tenants = directory.list().await?;
            if tenants.is_empty() {
                println!("No tenants.");
            }
            for t in tenants {
                println!(
                    "{}  {:<24} {:<10} {:<32} {}",
                    t.id(),
                    t.slug(),
                    t.status(),
                    t.partition(),
                    t.created_at().to_rfc3339()
                );
            }
        }
        Commands::DeadLetters { queue, limit } => {
            let broker = PgBroker::with_schema(pool, &config.broker.schema);
            let dead = broker.dead_letters(&queue, limit).await?;
            if dead.is_empty() {
                println!("No dead letters for {queue}.");
            }
            for d in dead {
                println!(
                    "#{} {} <- {} [{}] message={} attempts={} at={}\n    reason: {}",
                    d.id,
                    d.queue,
                    d.source_queue,
                    d.routing_key,
                    d.message_id,
                    d.attempts,
                    d.dead_lettered_at.to_rfc3339(),
                    d.reason
                );
            }
        }
    }

    Ok(())
}

fn schema_config(base: &str, partitions: &[String]) -> tenantry::Result<SchemaConfig> {
    let partitions = partitions
        .iter()
        .map(|p| PartitionLocator::parse(p.trim()))
        .collect::<tenantry::Result<Vec<_>>>()?;
    Ok(SchemaConfig::with_base_schema(base).with_partitions(partitions))
}

fn report_applied(plan: &SchemaPlan) {
    if plan.is_empty() {
        println!("No changes needed.");
    } else {
        println!("Applied changes:");
        print_plan(plan);
    }
}

fn print_plan(plan: &SchemaPlan) {
    if !plan.warnings().is_empty() {
        eprintln!("Warnings ({}):", plan.warnings().len());
        for w in plan.warnings() {
            eprintln!("  - {}", w);
        }
    }

    if plan.actions().is_empty() {
        println!("No pending DDL actions.");
        return;
    }

    println!("DDL actions ({}):", plan.actions().len());
    for (i, action) in plan.actions().iter().enumerate() {
        println!("{}. {}", i + 1, action.description());
        println!("{}\n", action.sql());
    }
}
