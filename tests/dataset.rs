//! End-to-end dataset store tests

use databank::{
    AccessMode, DataRow, DataValue, Database, DatabankError, DatasetOptions, Dtype, NdarrayData,
    QueryOptions, StoreMode, MAX_QUERY_LIMIT,
};
use serde_json::{json, Value as Json};

fn schema_def(value: Json) -> databank::SchemaDefinition {
    serde_json::from_value(value).unwrap()
}

fn indexed_options() -> DatasetOptions {
    DatasetOptions {
        schema: Some(schema_def(json!({
            "dataSchema": {
                "prop1": {"__tdxType": ["number", "Int32"]},
                "prop2": {"__tdxType": ["number", "Int32"]},
            },
            "uniqueIndex": [{"asc": "prop1"}],
        }))),
        ..Default::default()
    }
}

fn memory_db(options: &DatasetOptions) -> Database {
    let mut db = Database::open("unused", StoreMode::Memory, AccessMode::Create).unwrap();
    db.create_dataset(options).unwrap();
    db
}

fn row(value: Json) -> DataRow {
    DataRow::from_json(&value).unwrap()
}

fn rows(values: &[Json]) -> Vec<DataRow> {
    values.iter().map(|v| row(v.clone())).collect()
}

/// A hundred rows with prop1 counting up and prop2 counting down.
fn hundred_rows() -> Vec<DataRow> {
    (0..100)
        .map(|i| row(json!({"prop1": i, "prop2": 99 - i})))
        .collect()
}

#[test]
fn test_scalar_round_trip() {
    let options = DatasetOptions {
        schema: Some(schema_def(json!({
            "dataSchema": {
                "id": {"__tdxType": ["number", "Int32"]},
                "name": {"__tdxType": ["string"]},
                "score": {"__tdxType": ["number", "double"]},
                "active": {"__tdxType": ["boolean"]},
                "meta": {"nested": {"__tdxType": ["string"]}},
                "tags": [],
            },
            "uniqueIndex": [{"asc": "id"}],
        }))),
        ..Default::default()
    };
    let mut db = memory_db(&options);

    let added = db
        .add_data(&rows(&[json!({
            "id": 1,
            "name": "alpha",
            "score": 2.5,
            "active": true,
            "meta": {"nested": "x"},
            "tags": ["a", "b"],
        })]))
        .unwrap();
    assert_eq!(added, 1);

    let got = db.get_data(None, None, &QueryOptions::default()).unwrap();
    assert_eq!(got.data.len(), 1);
    let r = &got.data[0];
    assert_eq!(r.get("id"), Some(&DataValue::Int(1)));
    assert_eq!(r.get("name"), Some(&DataValue::Text("alpha".into())));
    assert_eq!(r.get("score"), Some(&DataValue::Float(2.5)));
    // Booleans are stored numerically.
    assert_eq!(r.get("active"), Some(&DataValue::Int(1)));
    assert_eq!(r.get("meta"), Some(&DataValue::Json(json!({"nested": "x"}))));
    assert_eq!(r.get("tags"), Some(&DataValue::Json(json!(["a", "b"]))));
}

#[test]
fn test_ndarray_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("arrays.sqlite");
    let mut db = Database::open(&store, StoreMode::File, AccessMode::Create).unwrap();
    db.create_dataset(&DatasetOptions {
        schema: Some(schema_def(json!({
            "dataSchema": {
                "id": {"__tdxType": ["number", "Int32"]},
                "tensor": {"__tdxType": ["ndarray"]},
            },
            "uniqueIndex": [{"asc": "id"}],
        }))),
        ..Default::default()
    })
    .unwrap();

    let mut bytes = Vec::new();
    for v in [1.5f64, -2.5, 3.25, 0.0, 99.0, -0.125] {
        bytes.extend_from_slice(&v.to_ne_bytes());
    }
    let array = NdarrayData::new(bytes, Dtype::Float64, vec![2, 3], true);

    let mut r = DataRow::new();
    r.set("id", DataValue::Int(1));
    r.set("tensor", DataValue::Ndarray(array.clone()));
    db.add_data(&[r]).unwrap();

    // The raw bytes live in a sidecar file next to the store.
    let blob_count = std::fs::read_dir(db.data_folder())
        .unwrap()
        .filter(|e| {
            e.as_ref()
                .unwrap()
                .path()
                .extension()
                .map_or(false, |ext| ext == "dat")
        })
        .count();
    assert_eq!(blob_count, 1);

    let got = db.get_data(None, None, &QueryOptions::default()).unwrap();
    assert_eq!(got.data.len(), 1);
    let Some(DataValue::Ndarray(restored)) = got.data[0].get("tensor") else {
        panic!("expected an ndarray cell");
    };
    assert_eq!(restored, &array);
}

#[test]
fn test_create_dataset_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("ds.sqlite");
    let options = DatasetOptions {
        id: Some("fixed-id".into()),
        ..indexed_options()
    };

    let mut db = Database::open(&store, StoreMode::File, AccessMode::Create).unwrap();
    let id = db.create_dataset(&options).unwrap();
    assert_eq!(id, "fixed-id");
    db.add_data(&rows(&[json!({"prop1": 1, "prop2": 2})])).unwrap();
    db.close().unwrap();

    // Re-creating with the same schema returns the stored id, even when a
    // different one is requested.
    let mut db = Database::open(&store, StoreMode::File, AccessMode::ReadWrite).unwrap();
    let id = db
        .create_dataset(&DatasetOptions {
            id: Some("other-id".into()),
            ..indexed_options()
        })
        .unwrap();
    assert_eq!(id, "fixed-id");
    let got = db.get_data(None, None, &QueryOptions::default()).unwrap();
    assert_eq!(got.data.len(), 1);

    // A different schema is rejected.
    let err = db
        .create_dataset(&DatasetOptions {
            schema: Some(schema_def(json!({
                "dataSchema": {"other": {"__tdxType": ["string"]}},
            }))),
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, DatabankError::SchemaMismatch { .. }));
}

#[test]
fn test_create_dataset_index_validation() {
    let mut db = Database::open("unused", StoreMode::Memory, AccessMode::Create).unwrap();

    let err = db
        .create_dataset(&DatasetOptions {
            schema: Some(schema_def(json!({
                "uniqueIndex": [{"asc": "missing"}],
            }))),
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, DatabankError::IndexWithoutSchema));

    let err = db
        .create_dataset(&DatasetOptions {
            schema: Some(schema_def(json!({
                "dataSchema": {"a": {"__tdxType": ["string"]}},
                "uniqueIndex": [{"asc": "missing"}],
            }))),
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, DatabankError::UnknownIndexColumn(c) if c == "missing"));
}

#[test]
fn test_open_missing_store_fails() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("absent.sqlite");
    let err = Database::open(&store, StoreMode::File, AccessMode::ReadOnly).unwrap_err();
    assert!(matches!(err, DatabankError::NotFound(_)));
}

#[test]
fn test_filter_combination() {
    let mut db = memory_db(&indexed_options());
    db.add_data(&hundred_rows()).unwrap();

    // The $or arm matching prop1 in [2, 5] is pruned by the prop2 bound
    // (those rows have prop2 in [94, 97]), leaving prop1 >= 92 only.
    let filter = json!({
        "$and": [
            {"$or": [
                {"prop1": {"$gte": 2, "$lte": 5}},
                {"prop1": {"$gte": 92}},
            ]},
            {"prop2": {"$lte": 10}},
        ]
    });
    let got = db
        .get_data(
            Some(&filter),
            None,
            &QueryOptions {
                sort: vec![("prop1".into(), 1)],
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(got.data.len(), 8);
    for (i, r) in got.data.iter().enumerate() {
        assert_eq!(r.get("prop1"), Some(&DataValue::Int(92 + i as i64)));
        assert_eq!(r.get("prop2"), Some(&DataValue::Int(7 - i as i64)));
    }

    let simple = json!({"prop1": {"$gte": 92}, "prop2": {"$lte": 7}});
    assert_eq!(db.get_dataset_data_count(Some(&simple)).unwrap(), 8);

    let nested = json!({
        "$or": [
            {"prop1": {"$lt": 2}},
            {"prop1": {"$gte": 98}},
        ]
    });
    assert_eq!(db.get_dataset_data_count(Some(&nested)).unwrap(), 4);
}

#[test]
fn test_pagination_and_limit_clamp() {
    let mut db = memory_db(&indexed_options());
    let many: Vec<DataRow> = (0..1200)
        .map(|i| row(json!({"prop1": i, "prop2": i})))
        .collect();
    db.add_data(&many).unwrap();

    // Unset and oversized limits clamp to the maximum page size.
    let got = db.get_data(None, None, &QueryOptions::default()).unwrap();
    assert_eq!(got.data.len(), MAX_QUERY_LIMIT as usize);
    let got = db
        .get_data(
            None,
            None,
            &QueryOptions {
                limit: Some(5000),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(got.data.len(), MAX_QUERY_LIMIT as usize);

    // Skip/limit paging with a stable sort.
    let got = db
        .get_data(
            None,
            None,
            &QueryOptions {
                skip: Some(10),
                limit: Some(3),
                sort: vec![("prop1".into(), 1)],
                ..Default::default()
            },
        )
        .unwrap();
    let values: Vec<_> = got.data.iter().map(|r| r.get("prop1").cloned()).collect();
    assert_eq!(
        values,
        vec![
            Some(DataValue::Int(10)),
            Some(DataValue::Int(11)),
            Some(DataValue::Int(12)),
        ]
    );

    assert_eq!(db.get_dataset_data_count(None).unwrap(), 1200);
}

#[test]
fn test_sort_descending() {
    let mut db = memory_db(&indexed_options());
    db.add_data(&hundred_rows()).unwrap();

    let got = db
        .get_data(
            None,
            None,
            &QueryOptions {
                limit: Some(1),
                sort: vec![("prop1".into(), -1)],
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(got.data[0].get("prop1"), Some(&DataValue::Int(99)));
}

#[test]
fn test_projection() {
    let mut db = memory_db(&indexed_options());
    db.add_data(&rows(&[json!({"prop1": 1, "prop2": 2})])).unwrap();

    // Inclusion wins.
    let got = db
        .get_data(None, Some(&json!({"prop1": 1})), &QueryOptions::default())
        .unwrap();
    assert_eq!(got.data[0].len(), 1);
    assert_eq!(got.data[0].get("prop1"), Some(&DataValue::Int(1)));

    // Exclusion subtracts from the schema columns.
    let got = db
        .get_data(None, Some(&json!({"prop1": 0})), &QueryOptions::default())
        .unwrap();
    assert_eq!(got.data[0].len(), 1);
    assert_eq!(got.data[0].get("prop2"), Some(&DataValue::Int(2)));

    // Unknown fields in the projection are ignored.
    let got = db
        .get_data(
            None,
            Some(&json!({"mystery": 1})),
            &QueryOptions::default(),
        )
        .unwrap();
    assert_eq!(got.data[0].len(), 2);
}

#[test]
fn test_unique_index_rejects_duplicates_atomically() {
    let mut db = memory_db(&indexed_options());
    db.add_data(&rows(&[json!({"prop1": 1, "prop2": 0})])).unwrap();

    let err = db
        .add_data(&rows(&[
            json!({"prop1": 2, "prop2": 0}),
            json!({"prop1": 1, "prop2": 0}),
        ]))
        .unwrap_err();
    assert!(matches!(err, DatabankError::Constraint(_)));

    // The whole batch rolled back, including the non-conflicting row.
    assert_eq!(db.get_dataset_data_count(None).unwrap(), 1);
}

#[test]
fn test_update_data_by_key() {
    let mut db = memory_db(&indexed_options());
    db.add_data(&hundred_rows()).unwrap();

    let result = db
        .update_data(&rows(&[json!({"prop1": 5, "prop2": 500})]), false, true)
        .unwrap();
    assert_eq!(result.response.as_deref(), Some("Success"));
    assert!(result.result.errors.is_empty());
    assert!(!result.command_id.is_empty());

    let got = db
        .get_data(Some(&json!({"prop1": 5})), None, &QueryOptions::default())
        .unwrap();
    assert_eq!(got.data[0].get("prop2"), Some(&DataValue::Int(500)));
}

#[test]
fn test_upsert_inserts_and_partially_updates() {
    let options = DatasetOptions {
        schema: Some(schema_def(json!({
            "dataSchema": {
                "id": {"__tdxType": ["number", "Int32"]},
                "a": {"__tdxType": ["number", "Int32"]},
                "b": {"__tdxType": ["number", "Int32"]},
            },
            "uniqueIndex": [{"asc": "id"}],
        }))),
        ..Default::default()
    };
    let mut db = memory_db(&options);
    db.add_data(&rows(&[json!({"id": 1, "a": 1, "b": 2})])).unwrap();

    // Upserting an existing key only touches the supplied non-key columns.
    db.update_data(&rows(&[json!({"id": 1, "a": 10})]), true, true)
        .unwrap();
    // Upserting a new key inserts.
    db.update_data(&rows(&[json!({"id": 2, "a": 20, "b": 21})]), true, true)
        .unwrap();

    let got = db
        .get_data(
            None,
            None,
            &QueryOptions {
                sort: vec![("id".into(), 1)],
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(got.data.len(), 2);
    assert_eq!(got.data[0].get("a"), Some(&DataValue::Int(10)));
    assert_eq!(got.data[0].get("b"), Some(&DataValue::Int(2)));
    assert_eq!(got.data[1].get("a"), Some(&DataValue::Int(20)));
}

#[test]
fn test_update_data_captures_errors_when_not_throwing() {
    let mut db = memory_db(&indexed_options());
    db.add_data(&rows(&[json!({"prop1": 1, "prop2": 0})])).unwrap();

    // A row without the key column cannot be addressed.
    let bad = rows(&[json!({"prop2": 9})]);
    let result = db.update_data(&bad, false, false).unwrap();
    assert_eq!(result.response, None);
    assert_eq!(result.result.errors.len(), 1);

    let err = db.update_data(&bad, false, true).unwrap_err();
    assert!(matches!(err, DatabankError::Validation(_)));
}

#[test]
fn test_update_data_by_query() {
    let mut db = memory_db(&indexed_options());
    db.add_data(&hundred_rows()).unwrap();

    let matched = db
        .update_data_by_query(Some(&json!({"prop1": {"$lt": 10}})), &row(json!({"prop2": 0})))
        .unwrap();
    assert_eq!(matched, 10);
    assert_eq!(
        db.get_dataset_data_count(Some(&json!({"prop2": 0, "prop1": {"$lt": 10}})))
            .unwrap(),
        10
    );

    // An empty patch touches nothing.
    let matched = db.update_data_by_query(None, &DataRow::new()).unwrap();
    assert_eq!(matched, 0);
}

#[test]
fn test_delete_and_reinsert() {
    let mut db = memory_db(&indexed_options());
    db.add_data(&hundred_rows()).unwrap();

    db.delete_data(&rows(&[json!({"prop1": 3}), json!({"prop1": 4})]))
        .unwrap();
    assert_eq!(db.get_dataset_data_count(None).unwrap(), 98);

    // A row missing the key column cannot be addressed.
    let err = db.delete_data(&rows(&[json!({"prop2": 9})])).unwrap_err();
    assert!(matches!(err, DatabankError::Validation(_)));

    // The freed key can be reused.
    db.add_data(&rows(&[json!({"prop1": 3, "prop2": 96})])).unwrap();
    assert_eq!(db.get_dataset_data_count(None).unwrap(), 99);
}

#[test]
fn test_delete_requires_unique_index() {
    let options = DatasetOptions {
        schema: Some(schema_def(json!({
            "dataSchema": {"a": {"__tdxType": ["number", "Int32"]}},
        }))),
        ..Default::default()
    };
    let mut db = memory_db(&options);
    db.add_data(&rows(&[json!({"a": 1})])).unwrap();

    let err = db.delete_data(&rows(&[json!({"a": 1})])).unwrap_err();
    assert!(matches!(err, DatabankError::Validation(_)));
}

#[test]
fn test_truncate_resource() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("trunc.sqlite");
    let mut db = Database::open(&store, StoreMode::File, AccessMode::Create).unwrap();
    db.create_dataset(&DatasetOptions {
        schema: Some(schema_def(json!({
            "dataSchema": {
                "id": {"__tdxType": ["number", "Int32"]},
                "tensor": {"__tdxType": ["ndarray"]},
            },
            "uniqueIndex": [{"asc": "id"}],
        }))),
        ..Default::default()
    })
    .unwrap();

    let array = NdarrayData::new(vec![1, 2, 3, 4], Dtype::Uint8, vec![4], true);
    let mut r = DataRow::new();
    r.set("id", DataValue::Int(1));
    r.set("tensor", DataValue::Ndarray(array));
    db.add_data(&[r]).unwrap();

    let removed = db.truncate_resource().unwrap();
    assert_eq!(removed, 1);
    assert_eq!(db.get_dataset_data_count(None).unwrap(), 0);

    // Blob files are gone but the folder survives.
    assert!(db.data_folder().is_dir());
    let blobs = std::fs::read_dir(db.data_folder())
        .unwrap()
        .filter(|e| {
            e.as_ref()
                .unwrap()
                .path()
                .extension()
                .map_or(false, |ext| ext == "dat")
        })
        .count();
    assert_eq!(blobs, 0);

    // The dataset stays usable after truncation.
    db.add_data(&rows(&[json!({"id": 2})])).unwrap();
    assert_eq!(db.get_dataset_data_count(None).unwrap(), 1);
}

#[test]
fn test_failed_insert_removes_extracted_blobs() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("orphans.sqlite");
    let mut db = Database::open(&store, StoreMode::File, AccessMode::Create).unwrap();
    db.create_dataset(&DatasetOptions {
        schema: Some(schema_def(json!({
            "dataSchema": {
                "id": {"__tdxType": ["number", "Int32"]},
                "tensor": {"__tdxType": ["ndarray"]},
            },
            "uniqueIndex": [{"asc": "id"}],
        }))),
        ..Default::default()
    })
    .unwrap();

    let array = NdarrayData::new(vec![1, 2, 3, 4], Dtype::Uint8, vec![4], true);
    let mut first = DataRow::new();
    first.set("id", DataValue::Int(1));
    first.set("tensor", DataValue::Ndarray(array.clone()));
    db.add_data(&[first.clone()]).unwrap();

    // A batch that rolls back must not leave its freshly extracted blob
    // files behind.
    let mut fresh = DataRow::new();
    fresh.set("id", DataValue::Int(2));
    fresh.set("tensor", DataValue::Ndarray(array));
    let err = db.add_data(&[fresh, first]).unwrap_err();
    assert!(matches!(err, DatabankError::Constraint(_)));

    let blobs = std::fs::read_dir(db.data_folder())
        .unwrap()
        .filter(|e| {
            e.as_ref()
                .unwrap()
                .path()
                .extension()
                .map_or(false, |ext| ext == "dat")
        })
        .count();
    assert_eq!(blobs, 1);

    // The surviving row still resolves its array.
    let got = db.get_data(None, None, &QueryOptions::default()).unwrap();
    assert_eq!(got.data.len(), 1);
    assert!(matches!(
        got.data[0].get("tensor"),
        Some(DataValue::Ndarray(_))
    ));
}

#[test]
fn test_get_distinct() {
    let options = DatasetOptions {
        schema: Some(schema_def(json!({
            "dataSchema": {
                "id": {"__tdxType": ["number", "Int32"]},
                "kind": {"__tdxType": ["string"]},
                "tensor": {"__tdxType": ["ndarray"]},
            },
            "uniqueIndex": [{"asc": "id"}],
        }))),
        ..Default::default()
    };
    let mut db = memory_db(&options);
    db.add_data(&rows(&[
        json!({"id": 1, "kind": "a"}),
        json!({"id": 2, "kind": "b"}),
        json!({"id": 3, "kind": "a"}),
    ]))
    .unwrap();

    let mut kinds = db.get_distinct("kind", None).unwrap();
    kinds.sort_by(|a, b| a.as_str().cmp(&b.as_str()));
    assert_eq!(kinds, vec![json!("a"), json!("b")]);

    let kinds = db
        .get_distinct("kind", Some(&json!({"id": {"$lt": 2}})))
        .unwrap();
    assert_eq!(kinds, vec![json!("a")]);

    // Unknown and array-typed fields yield nothing.
    assert_eq!(db.get_distinct("mystery", None).unwrap(), Vec::<Json>::new());
    assert_eq!(db.get_distinct("tensor", None).unwrap(), Vec::<Json>::new());
}

#[test]
fn test_get_resource_and_embedded_metadata() {
    let options = DatasetOptions {
        id: Some("res-1".into()),
        name: Some("readings".into()),
        description: Some("sensor readings".into()),
        parents: Some(vec!["parent-ds".into()]),
        tags: Some(vec!["sensors".into(), "test".into()]),
        ..indexed_options()
    };
    let mut db = memory_db(&options);

    let resource = db.get_resource().unwrap();
    assert_eq!(resource.id.as_deref(), Some("res-1"));
    assert_eq!(resource.name.as_deref(), Some("readings"));
    assert_eq!(resource.description.as_deref(), Some("sensor readings"));
    assert_eq!(resource.parents, Some(json!(["parent-ds"])));
    assert_eq!(resource.tags, Some(json!(["sensors", "test"])));
    let schema = resource.schema_definition.unwrap();
    assert!(schema.get("dataSchema").is_some());
    assert_eq!(schema["uniqueIndex"], json!([{"asc": "prop1"}]));

    db.add_data(&rows(&[json!({"prop1": 1, "prop2": 2})])).unwrap();
    let got = db
        .get_data(
            None,
            None,
            &QueryOptions {
                nqm_meta: true,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(
        got.meta_data.as_ref().and_then(|m| m.id.as_deref()),
        Some("res-1")
    );
}

#[test]
fn test_get_resource_without_dataset() {
    let db = Database::open("unused", StoreMode::Memory, AccessMode::Create).unwrap();
    let err = db.get_resource().unwrap_err();
    assert!(matches!(err, DatabankError::NotFound(_)));
}

#[test]
fn test_null_equality_filter() {
    let options = DatasetOptions {
        schema: Some(schema_def(json!({
            "dataSchema": {
                "id": {"__tdxType": ["number", "Int32"]},
                "note": {"__tdxType": ["string"]},
            },
            "uniqueIndex": [{"asc": "id"}],
        }))),
        ..Default::default()
    };
    let mut db = memory_db(&options);
    db.add_data(&rows(&[
        json!({"id": 1, "note": "present"}),
        json!({"id": 2}),
    ]))
    .unwrap();

    // Absent columns are stored as NULL and matched with {field: null}.
    let got = db
        .get_data(Some(&json!({"note": null})), None, &QueryOptions::default())
        .unwrap();
    assert_eq!(got.data.len(), 1);
    assert_eq!(got.data[0].get("id"), Some(&DataValue::Int(2)));
    assert_eq!(got.data[0].get("note"), Some(&DataValue::Null));

    // Null is not a valid operand for ordered comparisons.
    let err = db
        .get_data(
            Some(&json!({"note": {"$lt": null}})),
            None,
            &QueryOptions::default(),
        )
        .unwrap_err();
    assert!(matches!(err, DatabankError::Validation(_)));
}

#[test]
fn test_rows_with_extra_columns() {
    let mut db = memory_db(&indexed_options());
    // Columns outside the schema are dropped, not stored and not an error.
    db.add_data(&rows(&[json!({"prop1": 1, "prop2": 2, "mystery": "x"})]))
        .unwrap();

    let got = db.get_data(None, None, &QueryOptions::default()).unwrap();
    assert_eq!(got.data[0].len(), 2);
    assert_eq!(got.data[0].get("mystery"), None);
}
