use clap::{arg, value_parser, Command};

use ibkr_history::inspect::read_bars;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let matches = Command::new("inspect_bars")
        .version("1.0")
        .about("Summarizes a Parquet file written by fetch_bars")
        .arg(arg!(--path <PATH>).default_value("all_data.parquet"))
        .arg(arg!(--rows <N> "rows shown from each end").value_parser(value_parser!(usize)).default_value("5"))
        .get_matches();

    let path = matches.get_one::<String>("path").expect("path is required");
    let rows = *matches.get_one::<usize>("rows").expect("rows is required");

    let table = match read_bars(path) {
        Ok(table) => table,
        Err(e) => {
            println!("could not read {path}: {e}");
            return Ok(());
        }
    };

    println!("{path}: {} rows", table.len());

    println!("\nfirst rows:");
    for row in table.head(rows) {
        println!("  {row}");
    }

    println!("\nlast rows:");
    for row in table.tail(rows) {
        println!("  {row}");
    }

    println!("\nstatistics:");
    for stats in table.describe() {
        println!("  {stats}");
    }

    println!("\nmissing values:");
    for (column, count) in table.null_counts() {
        println!("  {column:<10} {count}");
    }

    Ok(())
}
