use std::{
    path::PathBuf,
    thread,
    time::{Duration, Instant},
};

use bitcoin::{consensus::deserialize, Block, BlockHash, OutPoint, Txid};
use clap::{Parser, Subcommand};
use log::*;

use txoloc::{
    accept::BoxError,
    client::Client,
    config::{Config, Network},
    db::{Database, RocksDb},
    notify::Notification,
    progress::BlockProgressLogger,
    store, Acceptor, AugmentedBlock, BehaviorFlags, BlockIndex, BlockNode, Chain,
    ContextValidator, InputLocation,
};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

/// Accepts blocks served by a trusted node, checking only that they connect
/// and match their merkle root.
struct TrustNode;

impl ContextValidator for TrustNode {
    fn check_block_context(
        &self,
        block: &Block,
        prev_node: &BlockNode,
        flags: BehaviorFlags,
    ) -> std::result::Result<(), BoxError> {
        if block.header.prev_blockhash != prev_node.hash() {
            return Err(format!("block doesn't build on {}", prev_node.hash()).into());
        }
        if !flags.contains(BehaviorFlags::FAST_ADD) && !block.check_merkle_root() {
            return Err("bad merkle root".into());
        }
        Ok(())
    }
}

#[derive(Parser)]
#[command(version, about, long_about = None)]
/// Bitcoin block acceptance, with persisted spent-output locations
struct Args {
    #[arg(value_enum, short = 'n', long = "network", default_value_t = Network::Bitcoin)]
    network: Network,

    /// Database directory (the network name is appended)
    #[arg(short = 'd', long = "db-dir", default_value = "db")]
    db_dir: PathBuf,

    /// bitcoind REST URL [default: http://localhost:<RPC port>]
    #[arg(short = 'u', long = "url")]
    url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch blocks from bitcoind, and accept them
    Sync {
        /// Stop after accepting this many blocks
        #[arg(short = 'l', long = "limit")]
        limit: Option<u64>,

        /// Exit when reaching the node's tip, instead of polling for new blocks
        #[arg(long = "once")]
        once: bool,
    },
    /// Print the resolved input locations and the flat outputs of a stored block
    ShowBlock {
        hash: BlockHash,

        /// Print the augmented block encoding
        #[arg(long = "hex", conflicts_with = "json")]
        hex: bool,

        /// Print the inputs and outputs as JSON
        #[arg(long = "json")]
        json: bool,
    },
}

#[derive(tabled::Tabled, serde::Serialize)]
struct InputEntry {
    tx: usize,
    input: usize,
    txid: Txid,
    outpoint: OutPoint,
    location: InputLocation,
}

fn input_entries(block: &AugmentedBlock) -> Vec<InputEntry> {
    let mut entries = vec![];
    for (tx_index, tx) in block.txdata.iter().enumerate() {
        let txid = tx.compute_txid();
        for (input_index, txin) in tx.input.iter().enumerate() {
            entries.push(InputEntry {
                tx: tx_index,
                input: input_index,
                txid,
                outpoint: txin.previous_output,
                location: txin.location,
            });
        }
    }
    entries
}

#[derive(tabled::Tabled, serde::Serialize)]
struct OutputEntry {
    tx: usize,
    outpoint: OutPoint,
    flat_index: u32,
    value: String,
    script_pubkey: String,
}

fn output_entries(block: &AugmentedBlock) -> Vec<OutputEntry> {
    block
        .outputs()
        .map(|output| OutputEntry {
            tx: output.tx_index,
            outpoint: output.outpoint,
            flat_index: output.flat_index,
            value: format!("{:.8}", output.txout.value.to_btc()),
            script_pubkey: output.txout.script_pubkey.to_hex_string(),
        })
        .collect()
}

fn print_table<T: tabled::Tabled>(entries: Vec<T>) {
    let mut tbl = tabled::Table::new(entries);
    tbl.with(tabled::settings::Style::rounded());
    tbl.modify(
        tabled::settings::object::Rows::new(1..),
        tabled::settings::Alignment::right(),
    );
    println!("{}", tbl);
}

fn fetch_genesis(client: &Client) -> Result<Block> {
    let hash = client
        .get_blockhash_by_height(0)?
        .ok_or("node has no genesis block (is REST enabled?)")?;
    Ok(client.get_block(hash)?.ok_or("missing genesis block")?)
}

fn sync(config: &Config, limit: Option<u64>, once: bool) -> Result<()> {
    let agent = ureq::Agent::new_with_config(
        ureq::config::Config::builder()
            .max_response_header_size(usize::MAX)
            .build(),
    );
    let client = Client::new(agent, config.url.as_str());
    let db = RocksDb::create(&config.db_path, config.network.into())?;
    let index = BlockIndex::load(&db)?;
    let chain = Chain::from_index(&index);
    let genesis = fetch_genesis(&client)?;
    let mut acceptor = Acceptor::new(db, index, TrustNode, chain, &genesis)?;

    let rx = acceptor.subscribe(1000);
    let subscriber = thread::spawn(move || {
        for notification in rx {
            let Notification::BlockAccepted {
                hash,
                height,
                block,
            } = notification;
            let inputs = block.inputs().count();
            debug!("accepted {} at height={}: {} inputs", hash, height, inputs);
        }
    });

    let mut progress = BlockProgressLogger::new("Processed", "txoloc::sync");
    let mut accepted_blocks = 0;
    loop {
        if limit.is_some_and(|limit| accepted_blocks >= limit) {
            break;
        }
        let height = acceptor.selector().tip_height().map_or(0, |h| h + 1);
        let Some(hash) = client.get_blockhash_by_height(height)? else {
            if once {
                break;
            }
            thread::sleep(Duration::from_secs(1));
            continue;
        };
        let Some(block) = client.get_block(hash)? else {
            warn!("block {} at height={} is not available", hash, height);
            thread::sleep(Duration::from_secs(1));
            continue;
        };
        let header = block.header;
        let tx_count = block.txdata.len();
        let accepted = acceptor.accept(block, BehaviorFlags::FAST_ADD)?;
        accepted_blocks += 1;
        progress.add_selection_time(accepted.selection_time);
        progress.log_block(accepted.height, &header, tx_count);
        if !accepted.is_main_chain {
            // the node switched to another branch
            warn!(
                "block {} at height={} is not on the main chain, stopping",
                accepted.hash, accepted.height
            );
            break;
        }
    }
    info!(
        "accepted {} blocks, tip={:?} at height={:?}",
        accepted_blocks,
        acceptor.selector().tip_hash(),
        acceptor.selector().tip_height()
    );
    acceptor.db().flush()?;
    drop(acceptor);
    subscriber.join().map_err(|_| "subscriber thread panicked")?;
    Ok(())
}

fn show_block(config: &Config, hash: BlockHash, hex: bool, json: bool) -> Result<()> {
    let db = RocksDb::open(&config.db_path, config.network.into())?;
    let t = Instant::now();
    let bytes = db
        .view(|tx| store::fetch_augmented_block_bytes(tx, &hash))?
        .ok_or_else(|| format!("block {} not found", hash))?;
    if hex {
        info!("fetched {} bytes [{:?}]", bytes.len(), t.elapsed());
        println!("{}", hex::encode(&bytes));
        return Ok(());
    }
    let block: AugmentedBlock = deserialize(&bytes)?;
    info!(
        "fetched block {}: {:.6} MB [{:?}]",
        hash,
        bytes.len() as f64 / 1e6,
        t.elapsed()
    );
    let inputs = input_entries(&block);
    let outputs = output_entries(&block);
    if json {
        let value = serde_json::json!({ "inputs": inputs, "outputs": outputs });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }
    let index = BlockIndex::load(&db)?;
    if let Some(node) = index.lookup_node(&hash) {
        println!(
            "block {} at height={} ({} txs, {} inputs, {} outputs)",
            hash,
            node.height(),
            block.txdata.len(),
            inputs.len(),
            outputs.len()
        );
    }
    print_table(inputs);
    print_table(outputs);
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::builder().format_timestamp_micros().init();
    let config = Config::new(args.network, &args.db_dir, args.url);
    info!("DB: {:?}, node URL: {}", config.db_path, config.url);
    match args.command {
        Command::Sync { limit, once } => sync(&config, limit, once),
        Command::ShowBlock { hash, hex, json } => show_block(&config, hash, hex, json),
    }
}
