//! Insertion and validation pipeline.
//!
//! Writers push a batch of records for one layer, tagged with the infra
//! version they belong to. The whole batch is validated up front and
//! rejected on the first violation, written inside one transaction, and
//! only then is the cache touched: one bounded invalidation per view,
//! covering the union of the geometry extents the batch contributed to that
//! view's indexed column.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use sqlx::PgPool;

use crate::cache::{self, TileCache};
use crate::config::{FieldKind, Layer};
use crate::error::Error;
use crate::tiles::{affected_tiles, BoundingBox, Tile};

/// One pushed record: field name to JSON value.
pub type Record = serde_json::Map<String, Value>;

/// Checks a whole batch against the layer's declared fields. All or
/// nothing: the first unknown field, missing mandatory field, or value of
/// the wrong kind rejects the batch before anything is written.
pub fn validate_batch(layer: &Layer, records: &[Record]) -> Result<(), Error> {
    let mandatory = layer.mandatory_fields();
    for record in records {
        for (name, value) in record {
            let Some(field) = layer.field(name) else {
                return Err(Error::UnknownField {
                    field: name.clone(),
                    valid: layer.fields.iter().map(|f| f.name.clone()).collect(),
                });
            };
            let ok = match field.kind {
                FieldKind::Geom => value.is_object(),
                FieldKind::Text => value.is_string(),
                FieldKind::Integer => value.is_i64(),
                FieldKind::Json => true,
            };
            if !ok {
                return Err(Error::InvalidValue {
                    field: name.clone(),
                    expected: field.kind.name(),
                });
            }
        }
        for field in &mandatory {
            if !record.contains_key(*field) {
                return Err(Error::MissingField {
                    field: field.to_string(),
                });
            }
        }
    }
    Ok(())
}

/// The bounding box of one GeoJSON geometry, folded over its coordinate
/// arrays. `None` for anything without usable coordinates, including
/// geometry collections.
pub fn geometry_bbox(value: &Value) -> Option<BoundingBox> {
    let coordinates = value.get("coordinates")?;
    let mut bbox = BoundingBox::default();
    extend_bbox(&mut bbox, coordinates);
    bbox.is_valid().then_some(bbox)
}

fn extend_bbox(bbox: &mut BoundingBox, value: &Value) {
    let Value::Array(items) = value else { return };
    // A position is an array whose first element is a number; anything else
    // is a nested ring/line/multi structure.
    match (items.first().and_then(Value::as_f64), items.get(1).and_then(Value::as_f64)) {
        (Some(lon), Some(lat)) => {
            bbox.union(&BoundingBox::from_point(lon, lat));
        }
        _ => {
            for item in items {
                extend_bbox(bbox, item);
            }
        }
    }
}

/// For every view of the layer, the union of the batch's geometry extents
/// on that view's indexed column. Views the batch contributes nothing to
/// are absent from the result.
pub fn affected_view_bboxes(
    layer: &Layer,
    records: &[Record],
) -> Result<HashMap<String, BoundingBox>, Error> {
    let mut out = HashMap::new();
    for view in &layer.views {
        let mut bbox = BoundingBox::default();
        for record in records {
            let Some(value) = record.get(&view.on_field) else {
                continue;
            };
            let extent = geometry_bbox(value).ok_or_else(|| Error::MalformedGeometry {
                field: view.on_field.clone(),
            })?;
            bbox.union(&extent);
        }
        if bbox.is_valid() {
            out.insert(view.name.clone(), bbox);
        }
    }
    Ok(out)
}

/// Writes the batch inside one transaction. Geometry fields go through
/// `ST_GeomFromGeoJSON`; the infra version lands in `infra_id`.
async fn insert_records(
    pool: &PgPool,
    layer: &Layer,
    infra: &str,
    records: &[Record],
) -> Result<(), Error> {
    let mut tx = pool.begin().await?;
    for record in records {
        let present: Vec<_> = layer
            .fields
            .iter()
            .filter(|field| record.contains_key(&field.name))
            .collect();

        let mut columns = vec!["infra_id".to_string()];
        let mut exprs = vec!["$1".to_string()];
        for (i, field) in present.iter().enumerate() {
            let param = i + 2;
            columns.push(field.name.clone());
            exprs.push(match field.kind {
                FieldKind::Geom => format!("ST_GeomFromGeoJSON(${param})"),
                _ => format!("${param}"),
            });
        }
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            layer.table_name,
            columns.join(", "),
            exprs.join(", ")
        );

        let mut query = sqlx::query(&sql).bind(infra);
        for field in &present {
            let value = &record[field.name.as_str()];
            query = match field.kind {
                FieldKind::Geom => query.bind(value.to_string()),
                FieldKind::Text => query.bind(value.as_str().unwrap_or_default().to_string()),
                FieldKind::Integer => query.bind(value.as_i64().unwrap_or_default()),
                FieldKind::Json => query.bind(value.clone()),
            };
        }
        query.execute(&mut *tx).await?;
    }
    tx.commit().await?;
    Ok(())
}

/// The write pipeline: validate, store, then invalidate the affected tiles
/// of every view in one batched call each. Returns the number of stored
/// records. An empty batch is accepted and does nothing.
pub async fn push_batch(
    pool: &PgPool,
    cache: &TileCache,
    prefix: &str,
    max_zoom: u64,
    layer: &Layer,
    infra: &str,
    records: &[Record],
) -> Result<usize, Error> {
    validate_batch(layer, records)?;
    let bboxes = affected_view_bboxes(layer, records)?;

    insert_records(pool, layer, infra, records).await?;

    let mut affected: HashMap<String, HashSet<Tile>> = HashMap::new();
    for (view, bbox) in &bboxes {
        affected.insert(view.clone(), affected_tiles(max_zoom, bbox)?);
    }
    cache::invalidate_tiles(cache, prefix, &layer.name, infra, &affected).await?;

    tracing::info!(
        layer = %layer.name,
        infra,
        records = records.len(),
        views = affected.len(),
        "batch stored and invalidated"
    );
    Ok(records.len())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::LayerSet;
    use crate::mercator;

    fn registry() -> LayerSet {
        LayerSet::from_yaml(
            r#"
name: railway
layers:
  - name: track_sections
    table_name: track_section_layer
    id_field: obj_id
    fields:
      - name: obj_id
        kind: text
      - name: geographic
        kind: geom
      - name: schematic
        kind: geom
      - name: line_code
        kind: integer
    views:
      - name: geo
        on_field: geographic
      - name: sch
        on_field: schematic
"#,
        )
        .expect("registry should validate")
    }

    fn record(fields: Value) -> Record {
        match fields {
            Value::Object(map) => map,
            _ => panic!("record fixtures must be objects"),
        }
    }

    fn point(lon: f64, lat: f64) -> Value {
        json!({ "type": "Point", "coordinates": [lon, lat] })
    }

    #[test]
    fn test_unknown_field_rejects_batch() {
        let registry = registry();
        let layer = registry.layer("track_sections").expect("layer exists");
        let records = vec![record(json!({
            "obj_id": "ts1",
            "geographic": point(2.35, 48.85),
            "schematic": point(2.35, 48.85),
            "mystery": 1,
        }))];
        match validate_batch(layer, &records) {
            Err(Error::UnknownField { field, valid }) => {
                assert_eq!("mystery", field);
                assert_eq!(
                    vec!["obj_id", "geographic", "schematic", "line_code"],
                    valid
                );
            }
            other => panic!("expected UnknownField, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_on_field_rejects_batch() {
        let registry = registry();
        let layer = registry.layer("track_sections").expect("layer exists");
        let records = vec![record(json!({
            "obj_id": "ts1",
            "geographic": point(2.35, 48.85),
        }))];
        assert!(matches!(
            validate_batch(layer, &records),
            Err(Error::MissingField { field }) if field == "schematic"
        ));
    }

    #[test]
    fn test_wrong_kind_rejects_batch() {
        let registry = registry();
        let layer = registry.layer("track_sections").expect("layer exists");
        let records = vec![record(json!({
            "obj_id": "ts1",
            "geographic": point(2.35, 48.85),
            "schematic": point(2.35, 48.85),
            "line_code": "not a number",
        }))];
        assert!(matches!(
            validate_batch(layer, &records),
            Err(Error::InvalidValue { expected: "integer", .. })
        ));
    }

    #[test]
    fn test_geometry_bbox_walks_nesting() {
        let line = json!({
            "type": "LineString",
            "coordinates": [[2.0, 48.0], [3.0, 49.0]],
        });
        assert_eq!(
            Some(BoundingBox((2.0, 48.0), (3.0, 49.0))),
            geometry_bbox(&line)
        );

        let multi = json!({
            "type": "MultiLineString",
            "coordinates": [[[2.0, 48.0], [3.0, 49.0]], [[-1.0, 47.0], [2.5, 48.5]]],
        });
        assert_eq!(
            Some(BoundingBox((-1.0, 47.0), (3.0, 49.0))),
            geometry_bbox(&multi)
        );

        assert_eq!(None, geometry_bbox(&json!({ "type": "GeometryCollection" })));
        assert_eq!(None, geometry_bbox(&json!({ "coordinates": [] })));
    }

    #[test]
    fn test_affected_bboxes_accumulate_per_view() {
        let registry = registry();
        let layer = registry.layer("track_sections").expect("layer exists");
        let records = vec![
            record(json!({
                "obj_id": "ts1",
                "geographic": point(2.0, 48.0),
                "schematic": point(10.0, 10.0),
            })),
            record(json!({
                "obj_id": "ts2",
                "geographic": point(3.0, 49.0),
                "schematic": point(11.0, 11.0),
            })),
        ];
        let bboxes = affected_view_bboxes(layer, &records).expect("valid geometry");
        assert_eq!(
            Some(&BoundingBox((2.0, 48.0), (3.0, 49.0))),
            bboxes.get("geo")
        );
        assert_eq!(
            Some(&BoundingBox((10.0, 10.0), (11.0, 11.0))),
            bboxes.get("sch")
        );
    }

    #[test]
    fn test_affected_tiles_span_adjacent_tiles() {
        // A segment crossing the boundary between x=511 and x=512 at zoom
        // 10 must affect exactly those two tiles at that zoom.
        let left = mercator::tile_bbox(10, 511, 340);
        let right = mercator::tile_bbox(10, 512, 340);
        let lat = (left.0 .1 + left.1 .1) / 2.0;
        let span = BoundingBox(
            ((left.0 .0 + left.1 .0) / 2.0, lat),
            ((right.0 .0 + right.1 .0) / 2.0, lat),
        );

        let tiles = affected_tiles(10, &span).expect("valid box");
        let at_max: Vec<_> = tiles.iter().filter(|t| t.zoom == 10).collect();
        assert_eq!(2, at_max.len());
        assert!(tiles.contains(&Tile { zoom: 10, x: 511, y: 340 }));
        assert!(tiles.contains(&Tile { zoom: 10, x: 512, y: 340 }));
    }
}
