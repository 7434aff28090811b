use std::error::Error;

use clap::{Parser, Subcommand};
use cproto::{Client, ClientConfig, Condition, Query, Results, Value};
use log::info;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Server url, `cproto://[user:password@]host:port/database`
    #[arg(long, default_value = "cproto://127.0.0.1:6534/test")]
    url: String,
    /// Connections opened up front
    #[arg(long, default_value_t = 1)]
    pool_size: usize,
    #[command(subcommand)]
    command: Action,
}

#[derive(Debug, Subcommand)]
enum Action {
    /// Check that the server answers
    Ping,
    /// Print the items of a namespace as JSON lines
    Select {
        namespace: String,
        #[arg(long)]
        limit: Option<i32>,
        /// `field=value` equality filter, may be repeated
        #[arg(long = "where", value_parser = parse_filter)]
        filters: Vec<(String, String)>,
    },
    /// Run an SQL select
    Sql { query: String },
    MetaGet { namespace: String, key: String },
    MetaPut {
        namespace: String,
        key: String,
        value: String,
    },
}

fn parse_filter(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(field, value)| (field.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected field=value, got `{s}`"))
}

fn filter_value(raw: &str) -> Value {
    if let Ok(v) = raw.parse::<i64>() {
        Value::from(v)
    } else if let Ok(v) = raw.parse::<f64>() {
        Value::from(v)
    } else if let Ok(v) = raw.parse::<bool>() {
        Value::from(v)
    } else {
        Value::from(raw)
    }
}

fn print_results(results: Results) -> Result<(), Box<dyn Error>> {
    for record in results {
        let json = serde_json::Value::from(record?.value);
        println!("{json}");
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let config = ClientConfig::from_url(&cli.url)?.with_pool_size(cli.pool_size);
    let client = Client::connect(config)?;

    let pool = client.pool().clone();
    ctrlc::set_handler(move || {
        info!("interrupted, closing connections");
        pool.close();
        std::process::exit(130);
    })?;

    match cli.command {
        Action::Ping => {
            client.ping()?;
            println!("ok");
        }
        Action::Select {
            namespace,
            limit,
            filters,
        } => {
            let mut query = Query::new(namespace);
            for (field, value) in &filters {
                query = query.where_(field, Condition::Eq, filter_value(value));
            }
            if let Some(limit) = limit {
                query = query.limit(limit);
            }
            print_results(client.select(query)?)?;
        }
        Action::Sql { query } => print_results(client.select_sql(&query)?)?,
        Action::MetaGet { namespace, key } => println!("{}", client.get_meta(&namespace, &key)?),
        Action::MetaPut {
            namespace,
            key,
            value,
        } => client.put_meta(&namespace, &key, &value)?,
    }

    client.close();
    Ok(())
}
