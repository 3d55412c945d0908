use anyhow::{bail, Context, Result};
use env_logger::Env;

use slimtree::city::{City, CityDistance};
use slimtree::{DiskPageManager, PageManager, SlimTree};

const PAGE_SIZE: u32 = 1024;

type CityTree = SlimTree<City, CityDistance, DiskPageManager>;

// Driver program exercising the index end to end: builds a city tree on disk
// from a tab-separated file and reports the average cost of query batches.
fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = std::env::args().collect::<Vec<_>>();
    match args.len() {
        0 | 1 => bail!("Missing <tree file> and <command>"),
        2 => bail!("Missing <command>"),
        _ => {}
    }

    let tree_file = &args[1];
    let command = &args[2];
    match command.as_str() {
        ".build" => {
            // create the tree file and load every city from the data file
            let city_file = args.get(3).context("Missing <city file>")?;
            let pager = DiskPageManager::create(tree_file, PAGE_SIZE)?;
            let mut tree = CityTree::new(pager, CityDistance)?;

            let cities = load_cities(city_file)?;
            for city in &cities {
                tree.add(city)?;
            }
            println!(
                "Added {} objects ({} nodes, height {})",
                tree.num_objects(),
                tree.node_count(),
                tree.height()
            );
        }
        ".info" => {
            let pager = DiskPageManager::open(tree_file)?;
            let tree = CityTree::new(pager, CityDistance)?;
            println!("Objects: {}", tree.num_objects());
            println!("Nodes:   {}", tree.node_count());
            println!("Height:  {}", tree.height());
            println!("Pages:   {}", tree.page_manager().page_count());
        }
        ".range" => {
            let query_file = args.get(3).context("Missing <query file>")?;
            let radius: f64 = args
                .get(4)
                .context("Missing <radius>")?
                .parse()
                .context("Invalid <radius>")?;

            let pager = DiskPageManager::open(tree_file)?;
            let mut tree = CityTree::new(pager, CityDistance)?;
            let queries = load_cities(query_file)?;

            tree.page_manager_mut().reset_statistics();
            tree.metric_evaluator().reset_statistics();
            let mut found = 0usize;
            for query in &queries {
                found += tree.range_query(query, radius)?.len();
            }
            report_averages(&tree, queries.len(), found);
        }
        ".nearest" => {
            let query_file = args.get(3).context("Missing <query file>")?;
            let k: usize = args
                .get(4)
                .context("Missing <k>")?
                .parse()
                .context("Invalid <k>")?;

            let pager = DiskPageManager::open(tree_file)?;
            let mut tree = CityTree::new(pager, CityDistance)?;
            let queries = load_cities(query_file)?;

            tree.page_manager_mut().reset_statistics();
            tree.metric_evaluator().reset_statistics();
            let mut found = 0usize;
            for query in &queries {
                found += tree.nearest_query(query, k, false)?.len();
            }
            report_averages(&tree, queries.len(), found);
        }
        _ => bail!("Unknown command: {command}"),
    }

    Ok(())
}

// Each line holds: name <tab> latitude <tab> longitude
fn load_cities(path: &str) -> Result<Vec<City>> {
    let content = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    let mut cities = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split('\t');
        let name = fields.next().context("missing city name")?;
        let latitude: f64 = fields
            .next()
            .context("missing latitude")?
            .trim()
            .parse()
            .context("invalid latitude")?;
        let longitude: f64 = fields
            .next()
            .context("missing longitude")?
            .trim()
            .parse()
            .context("invalid longitude")?;
        cities.push(City::new(name, latitude, longitude));
    }
    Ok(cities)
}

fn report_averages(tree: &CityTree, queries: usize, found: usize) {
    let queries = queries.max(1) as f64;
    println!("Results:                   {found}");
    println!(
        "Avg Page Accesses:         {:.2}",
        tree.page_manager().reads() as f64 / queries
    );
    println!(
        "Avg Disk Reads:            {:.2}",
        tree.page_manager().disk_reads() as f64 / queries
    );
    println!(
        "Avg Distance Calculations: {:.2}",
        tree.metric_evaluator().distance_count() as f64 / queries
    );
}
