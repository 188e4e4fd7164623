use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use end_model::{EndModel, Matrix, Metric};

fn blobs(rng: &mut StdRng, n_per_class: usize) -> end_model::Result<(Matrix, Matrix)> {
    let centers = [[-1.0_f32, -1.0], [1.0, -1.0], [0.0, 1.0]];
    let mut xs = Vec::with_capacity(3 * n_per_class);
    let mut ys = Vec::with_capacity(3 * n_per_class);

    for (class, center) in centers.iter().enumerate() {
        for _ in 0..n_per_class {
            let x0 = center[0] + rng.gen_range(-0.3..0.3);
            let x1 = center[1] + rng.gen_range(-0.3..0.3);
            xs.push(vec![x0, x1]);
            ys.push(class);
        }
    }

    Ok((Matrix::from_rows(&xs)?, Matrix::from_labels(&ys)))
}

fn main() -> end_model::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut rng = StdRng::seed_from_u64(0);
    let (x_train, y_train) = blobs(&mut rng, 128)?;
    let (x_dev, y_dev) = blobs(&mut rng, 32)?;

    let mut model = EndModel::new(
        3,
        json!({
            "seed": 0,
            "verbose": true,
            "batchnorm": true,
            "dropout": 0.1,
            "layer_out_dims": [2, 16],
        }),
    )?;

    let report = model.train(
        &x_train,
        &y_train,
        Some((&x_dev, &y_dev)),
        &json!({
            "train_config": {
                "n_epochs": 30,
                "print_every": 5,
                "scheduler_config": {"scheduler": "step", "step_size": 10, "gamma": 0.5}
            }
        }),
    )?;

    println!(
        "final train_loss={:?} best_epoch={:?} best_dev_score={:?}",
        report.final_loss(),
        report.best_epoch,
        report.best_dev_score
    );
    println!(
        "dev accuracy={} top2={}",
        model.score(&x_dev, &y_dev, Metric::Accuracy)?,
        model.score(&x_dev, &y_dev, Metric::TopKAccuracy { k: 2 })?
    );

    Ok(())
}
