use clap::Parser;
use icd10_coverage::{
    catalog::Signatures,
    codelist::{CodeSet, CreationMethod},
    consumers::{discrepancies, map_to_consumers, save_consumers},
    header,
    report::{load_coverage_report, member_codes},
    row,
    scenario::{
        all_field_total, compute_all, save_scenarios, save_usage_scenarios, scenario_totals,
        usage_scenarios, with_method, Field, Scenario, ScenarioColumns, ScenarioResult,
        ScenarioTotal, Unaffected, UsageScenarioRow,
    },
    usage::{DataSource, UsageTable, UsageTotals},
    Config, Thousands,
};
use qu::ick_use::*;
use std::path::PathBuf;
use term_data_table::Table;

#[derive(Parser)]
struct Opt {
    /// Config file (TOML). Built in defaults are used for anything it doesn't set.
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// The coverage report to aggregate
    #[clap(short, long, value_enum, default_value_t = DataSource::Apcs)]
    source: DataSource,
}

#[qu::ick]
pub fn main(opt: Opt) -> Result {
    let config = Config::load_or_default(opt.config.as_deref())?;
    let source = opt.source;
    let rows = load_coverage_report(config.coverage_report_path(source))?;
    let members = member_codes(&rows);
    let results = compute_all(rows, &ScenarioColumns::for_source(source), config.policy)?;
    save_scenarios(config.scenarios_path(source), &results)?;

    let builder = CreationMethod::Builder;
    let uploaded = CreationMethod::Uploaded;
    let inline = CreationMethod::Inline;

    header(&format!("Prefix matching: {}", source.label()));
    println!("codelists analyzed: {}", results.len());
    println!("builder: {}", with_method(&results, &builder).count());
    println!("uploaded: {}", with_method(&results, &uploaded).count());
    println!("inline: {}", with_method(&results, &inline).count());

    let standard = [Scenario::Strict, Scenario::Partial];
    let with_lax = [Scenario::Strict, Scenario::Partial, Scenario::Lax];
    for field in [Field::Primary, Field::Secondary] {
        header(&format!("{} diagnosis field", field));
        print_totals(scenario_totals(&results, field, &standard));
        print_unaffected(&results, field, &standard);

        println!("Builder codelists");
        print_totals(scenario_totals(with_method(&results, &builder), field, &standard));
        println!("Uploaded codelists");
        print_totals(scenario_totals(with_method(&results, &uploaded), field, &with_lax));
        println!("Inline codelists");
        print_totals(scenario_totals(with_method(&results, &inline), field, &standard));
    }

    if ScenarioColumns::for_source(source).all.is_some() {
        header("All diagnoses field");
        println!("Builder codelists");
        print_totals(vec![all_field_total(with_method(&results, &builder))]);
        println!("Uploaded codelists");
        print_totals(vec![all_field_total(with_method(&results, &uploaded))]);
    }

    if source == DataSource::Apcs {
        let usage = UsageTable::load(config.combined_usage_path(source))?;
        let totals = UsageTotals::from_table(&usage, config.report_year);
        let usage_rows: Vec<UsageScenarioRow> = members
            .into_iter()
            .map(|(codelist_id, codes)| {
                let scenarios = usage_scenarios(&CodeSet::from(codes), &totals);
                UsageScenarioRow {
                    codelist_id,
                    exact_match: scenarios.exact,
                    with_prefix: scenarios.with_prefix,
                    with_x_padding: scenarios.with_x_padding,
                }
            })
            .collect();
        save_usage_scenarios(config.usage_scenarios_path(), &usage_rows)?;

        header(&format!("Primary diagnosis usage in {}", config.report_year));
        let (exact, prefix, padded) = usage_rows.iter().fold((0, 0, 0), |(e, p, x), r| {
            (e + r.exact_match, p + r.with_prefix, x + r.with_x_padding)
        });
        let mut table = Table::new().with_row(row(["Matching", "Total Events"]));
        table.add_row(row(["Exact".to_string(), Thousands(exact).to_string()]));
        table.add_row(row(["With X padding".to_string(), Thousands(padded).to_string()]));
        table.add_row(row(["With prefix matching".to_string(), Thousands(prefix).to_string()]));
        println!("{}", table);
    }

    let signatures = Signatures::load(config.signatures_path())?;
    let index = signatures.consumer_index();
    let found = discrepancies(&results);
    let consumer_rows = map_to_consumers(&found, &index);
    save_consumers(config.consumers_path(source), &consumer_rows)?;
    let repos = consumer_rows
        .iter()
        .map(|r| &r.repo)
        .collect::<std::collections::BTreeSet<_>>();
    header("Affected repositories");
    println!(
        "{} codelists with discrepancies across {} repos",
        found.len(),
        repos.len()
    );
    Ok(())
}

fn print_totals(totals: Vec<ScenarioTotal>) {
    let baseline = match totals.first() {
        Some(total) => total.baseline,
        None => return,
    };
    let mut table = Table::new().with_row(row([
        "Scenario",
        "Total Events",
        "Difference from Baseline",
        "% Increase",
    ]));
    table.add_row(row([
        "Baseline".to_string(),
        Thousands(baseline).to_string(),
        "-".into(),
        "-".into(),
    ]));
    for total in &totals {
        table.add_row(row([
            total.label.to_string(),
            Thousands(total.total).to_string(),
            format!("+{}", Thousands(total.difference())),
            format!("+{:.2}%", total.percent_increase()),
        ]));
    }
    println!("{}", table);
}

fn print_unaffected(results: &[ScenarioResult], field: Field, scenarios: &[Scenario]) {
    let builder = CreationMethod::Builder;
    let uploaded = CreationMethod::Uploaded;
    let mut table = Table::new().with_row(row(["Comparison", "All Codelists", "Builder", "Uploaded"]));
    for scenario in scenarios {
        table.add_row(row([
            format!("{} vs Baseline", scenario.label()),
            Unaffected::count(results, field, *scenario).to_string(),
            Unaffected::count(with_method(results, &builder), field, *scenario).to_string(),
            Unaffected::count(with_method(results, &uploaded), field, *scenario).to_string(),
        ]));
    }
    println!("{}", table);
}
