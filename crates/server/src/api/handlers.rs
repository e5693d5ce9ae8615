use std::fmt::Write;

use metric_types::Metrics;
use poem::handler;
use poem::http::StatusCode;
use poem::web::Data;
use poem::web::Html;
use poem::web::Json;
use poem::web::Path;
use tracing::error;

use super::errors::store_error;
use crate::aggregator::Aggregator;

fn plain_value(record: &Metrics) -> String {
    match (record.delta, record.value) {
        (Some(delta), _) => delta.to_string(),
        (None, Some(value)) => value.to_string(),
        (None, None) => String::new(),
    }
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Merge one JSON record
#[handler]
pub async fn update_json(
    Data(aggregator): Data<&Aggregator>,
    Json(record): Json<Metrics>,
) -> poem::Result<Json<Metrics>> {
    let merged = aggregator.update(record).await.map_err(store_error)?;
    Ok(Json(merged))
}

/// Merge a JSON array of records
#[handler]
pub async fn update_batch_json(
    Data(aggregator): Data<&Aggregator>,
    Json(records): Json<Vec<Metrics>>,
) -> poem::Result<Json<Vec<Metrics>>> {
    let merged = aggregator
        .update_batch(records)
        .await
        .map_err(store_error)?;
    Ok(Json(merged))
}

/// Look up the record named by `id` and `type`
#[handler]
pub async fn value_json(
    Data(aggregator): Data<&Aggregator>,
    Json(query): Json<Metrics>,
) -> poem::Result<Json<Metrics>> {
    let found = aggregator
        .value(&query.kind, &query.id)
        .await
        .map_err(store_error)?;
    Ok(Json(found))
}

#[handler]
pub async fn update_plain(
    Path((kind, name, value)): Path<(String, String, String)>,
    Data(aggregator): Data<&Aggregator>,
) -> poem::Result<String> {
    let merged = aggregator
        .update_plain(&kind, &name, &value)
        .await
        .map_err(store_error)?;
    Ok(plain_value(&merged))
}

#[handler]
pub async fn value_plain(
    Path((kind, name)): Path<(String, String)>,
    Data(aggregator): Data<&Aggregator>,
) -> poem::Result<String> {
    let found = aggregator.value(&kind, &name).await.map_err(store_error)?;
    Ok(plain_value(&found))
}

/// HTML listing of every stored metric
#[handler]
pub async fn index(Data(aggregator): Data<&Aggregator>) -> poem::Result<Html<String>> {
    let samples = aggregator.snapshot().await.map_err(store_error)?;

    let mut page = String::from("<html><head><title>Metrics</title></head><body><ul>");
    for sample in &samples {
        // writing into a String cannot fail
        let _ = write!(
            page,
            "<li>{} ({}): {}</li>",
            escape_html(&sample.name),
            sample.value.kind(),
            sample.value
        );
    }
    page.push_str("</ul></body></html>");
    Ok(Html(page))
}

#[handler]
pub async fn ping(Data(aggregator): Data<&Aggregator>) -> StatusCode {
    match aggregator.ping().await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            error!("store ping failed: {e:?}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[cfg(test)]
mod tests {
    use metric_types::Sample;

    use super::*;

    #[test]
    fn plain_value_prints_the_payload() {
        assert_eq!(plain_value(&Metrics::from(Sample::counter("c", 12))), "12");
        assert_eq!(plain_value(&Metrics::from(Sample::gauge("g", 37.1))), "37.1");
    }

    #[test]
    fn metric_names_are_escaped() {
        assert_eq!(escape_html("<b>&\"x\""), "&lt;b&gt;&amp;&quot;x&quot;");
    }
}
