use clap::Parser;
use icd10_coverage::{
    classify::Classification, header, report::save_coverage_report, row, usage::DataSource,
    AnalysisContext, Config,
};
use qu::ick_use::*;
use std::path::PathBuf;
use term_data_table::Table;

#[derive(Parser)]
struct Opt {
    /// Config file (TOML). Built in defaults are used for anything it doesn't set.
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// Only analyze this data source
    #[clap(short, long, value_enum)]
    source: Option<DataSource>,
}

#[qu::ick]
pub fn main(opt: Opt) -> Result {
    let config = Config::load_or_default(opt.config.as_deref())?;
    let mut ctx = AnalysisContext::init(config)?;
    let codelists = ctx.load_codelists();
    let sources = match opt.source {
        Some(source) => vec![source],
        None => DataSource::ALL.to_vec(),
    };

    header("Codelist coverage");
    println!("codelists loaded: {}", codelists.len());
    println!(
        "referenced from ehrQL: {}",
        codelists.iter().filter(|c| c.from_ehrql).count()
    );

    let mut table = Table::new().with_row(row([
        "Source",
        "Codelists",
        "COMPLETE",
        "PARTIAL",
        "NONE",
        "Not in hierarchy",
        "Used codes missing from dictionary",
    ]));
    for source in sources {
        let usage = ctx.load_usage(source)?;
        let results = ctx.analyze(&codelists, &usage, source);
        let path = ctx.config.coverage_report_path(source);
        save_coverage_report(&path, &results, &usage, source, ctx.config.report_year)?;
        event!(Level::INFO, "wrote {}", path.display());

        let count = |class: Classification| {
            results
                .iter()
                .flat_map(|r| r.classifications.values())
                .filter(|c| **c == class)
                .count()
        };
        let outside: usize = results.iter().map(|r| r.outside_hierarchy.len()).sum();
        let missing: usize = results.iter().map(|r| r.missing_descendants.len()).sum();
        table.add_row(row([
            source.label().to_string(),
            results.len().to_string(),
            count(Classification::Complete).to_string(),
            count(Classification::Partial).to_string(),
            count(Classification::None).to_string(),
            outside.to_string(),
            missing.to_string(),
        ]));
    }
    println!("{}", table);
    Ok(())
}
