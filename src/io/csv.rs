/*!
# Saving Draws to CSV

Writes sampler output to CSV files. Enable via the `csv` feature.
*/

use crate::hmc::Trace;
use csv::Writer;
use ndarray::{Array2, Axis};
use std::error::Error;
use std::fs::File;

/**
Saves the draws of every chain in long format.

The file has a header row `chain,draw,theta` followed by one row per retained draw,
chain after chain.

# Examples

```rust
use coinflip_mcmc::hmc::{HmcConfig, HMC};
use coinflip_mcmc::io::csv::save_csv;
use coinflip_mcmc::model::CoinFlipModel;

let posterior = CoinFlipModel::new(10).condition(7).unwrap();
let config = HmcConfig::default()
    .with_num_burnin_steps(20)
    .with_num_adaptation_steps(10)
    .with_num_results(50)
    .with_seed(1);
let trace = HMC::new(posterior, config)?.run()?;
save_csv(&trace, "/tmp/coin_trace.csv")?;
# Ok::<(), Box<dyn std::error::Error>>(())
```
*/
pub fn save_csv(trace: &Trace, filename: &str) -> Result<(), Box<dyn Error>> {
    let mut wtr = Writer::from_writer(File::create(filename)?);
    wtr.write_record(["chain", "draw", "theta"])?;

    for (chain_idx, chain) in trace.chains().iter().enumerate() {
        for (draw_idx, theta) in chain.samples().iter().enumerate() {
            wtr.write_record(&[
                chain_idx.to_string(),
                draw_idx.to_string(),
                theta.to_string(),
            ])?;
        }
    }

    wtr.flush()?;
    Ok(())
}

/**
Saves a chain × draw matrix, one row per chain.

The header row is `chain,draw_0,draw_1,...`.
*/
pub fn save_csv_array(data: &Array2<f64>, filename: &str) -> Result<(), Box<dyn Error>> {
    let mut wtr = Writer::from_writer(File::create(filename)?);

    let mut header = vec!["chain".to_string()];
    header.extend((0..data.ncols()).map(|i| format!("draw_{i}")));
    wtr.write_record(&header)?;

    for (chain_idx, chain) in data.axis_iter(Axis(0)).enumerate() {
        let mut row = vec![chain_idx.to_string()];
        row.extend(chain.iter().map(|v| v.to_string()));
        wtr.write_record(&row)?;
    }

    wtr.flush()?;
    Ok(())
}
