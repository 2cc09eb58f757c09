use clap::Parser;
use icd10_coverage::{
    context::usage_chain,
    header, row,
    universe::Universes,
    usage::{write_combined_usage, CodeGaps, DataSource},
    Config, Thousands,
};
use qu::ick_use::*;
use std::{fs, io, path::PathBuf};
use term_data_table::Table;

#[derive(Parser)]
struct Opt {
    /// Config file (TOML). Built in defaults are used for anything it doesn't set.
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// Skip the remote archive and only use local copies of the usage extracts.
    #[clap(long)]
    offline: bool,
}

#[qu::ick]
pub fn main(opt: Opt) -> Result {
    let config = Config::load_or_default(opt.config.as_deref())?;
    let universes = Universes::load(config.reference_codes_path(), &config.reference)?;
    let outcome = usage_chain(&config, opt.offline)?.load()?;

    header("Usage sources");
    println!("loaded from: {}", outcome.strategy);
    for (name, reason) in &outcome.fallbacks {
        println!("{} unavailable: {}", name, reason);
    }

    fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("creating \"{}\"", config.output_dir.display()))?;
    let mut table = Table::new().with_row(row(["Source", "Codes", "Not in dictionary"]));
    for source in DataSource::ALL {
        let usage = outcome.archive.get(source);
        let universe = universes.get(source);
        let path = config.combined_usage_path(source);
        let file = fs::File::create(&path)
            .with_context(|| format!("creating \"{}\"", path.display()))?;
        write_combined_usage(io::BufWriter::new(file), usage, source, universe)?;
        event!(Level::INFO, "wrote {}", path.display());

        let outside = usage.codes().filter(|code| !universe.contains(*code)).count();
        table.add_row(row([
            source.label().to_string(),
            Thousands(usage.len() as u64).to_string(),
            Thousands(outside as u64).to_string(),
        ]));
    }
    println!("{}", table);

    let gaps = CodeGaps::find(&outcome.archive, &universes.ons_deaths);
    gaps.save(&config.output_dir, &outcome.archive, &outcome.provenance())?;
    header("Dictionary gaps");
    println!("used but not in the dictionary: {}", Thousands(gaps.missing.len() as u64));
    println!("in the dictionary but never used: {}", Thousands(gaps.unused.len() as u64));
    Ok(())
}
