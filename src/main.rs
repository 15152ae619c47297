use anyhow::{Context, Result};
use crisis_gbdt::data_loader::chronological_split;
use crisis_gbdt::{Classifier, CrisisModel, DataLoader, PipelineConfig};
use std::fs;
use tracing::{debug, info, instrument};

#[instrument]
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    info!("Starting crisis regime pipeline");

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());
    debug!("Loading config from path: {}", config_path);
    let config = PipelineConfig::load(&config_path)
        .with_context(|| format!("Failed to load config from {config_path}"))?;
    debug!(?config, "Config loaded successfully");

    let data = config.data;
    let mut loader = DataLoader::new(&data.path, &data.target_column, &data.date_column)
        .with_feature_params(config.feature_params);
    loader.load().context("Failed to load market data")?;
    loader
        .clean(data.drop_missing, &data.fill_strategy)
        .context("Failed to clean market data")?;
    let rows = loader.engineer_features().context("Failed to engineer features")?.height();
    info!(rows, "Features engineered");

    let (features, targets) = loader.split(&data.drop_columns)?;
    info!(
        features = features.width(),
        rows = features.height(),
        "Features and target separated"
    );

    // test rows are held out of early stopping, validation comes from the train tail
    let ((train_x, train_y), (test_x, test_y)) =
        chronological_split(&features, &targets, data.test_fraction)
            .context("Failed to split train and test rows")?;
    let ((fit_x, fit_y), validation) = chronological_split(&train_x, &train_y, data.test_fraction)
        .context("Failed to split validation rows")?;

    let model = CrisisModel::with_overrides(config.model);
    let trained = model
        .train(
            &fit_x,
            &fit_y,
            &[validation],
            Some(config.output.early_stopping_rounds),
        )
        .context("Model training failed")?;

    let evaluation = trained
        .evaluate(&test_x, &test_y)
        .context("Model evaluation failed")?;
    info!(
        roc_auc = evaluation.roc_auc,
        accuracy = evaluation.report.accuracy,
        confusion = ?evaluation.confusion_matrix.as_table(),
        "Evaluation on held-out rows"
    );

    for (name, score) in trained.feature_importance().iter().take(10) {
        info!(feature = %name, importance = score, "Feature importance");
    }

    trained
        .save(&config.output.model_path)
        .context("Failed to save model")?;

    if let Some(report_path) = &config.output.report_path {
        if let Some(parent) = report_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(report_path, serde_json::to_string_pretty(&evaluation)?)
            .with_context(|| format!("Failed to write report to {}", report_path.display()))?;
        info!("Evaluation report written to {}", report_path.display());
    }

    info!(
        "Training complete! Model saved as {}",
        config.output.model_path.display()
    );
    Ok(())
}
