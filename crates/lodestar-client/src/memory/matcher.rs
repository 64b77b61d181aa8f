//! Filter matching, updates, sorting and projection over documents.

use std::cmp::Ordering;

use bson::{Bson, Document};

/// Looks up a dotted path.
pub(crate) fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Bson::Document(inner) => inner.get(part)?,
            _ => return None,
        };
    }
    Some(current)
}

fn set_path(doc: &mut Document, path: &str, value: Bson) -> Result<(), String> {
    match path.split_once('.') {
        None => {
            doc.insert(path, value);
            Ok(())
        }
        Some((head, rest)) => {
            if !doc.contains_key(head) {
                doc.insert(head, Document::new());
            }
            match doc.get_mut(head) {
                Some(Bson::Document(inner)) => set_path(inner, rest, value),
                _ => Err(format!("cannot set {} on a non-document field", path)),
            }
        }
    }
}

fn remove_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Bson::Document(inner)) = doc.get_mut(head) {
                remove_path(inner, rest);
            }
        }
    }
}

/// Orders two values of comparable types.
pub(crate) fn compare(a: &Bson, b: &Bson) -> Option<Ordering> {
    match (as_f64(a), as_f64(b)) {
        (Some(x), Some(y)) => return x.partial_cmp(&y),
        (None, None) => {}
        _ => return None,
    }
    match (a, b) {
        (Bson::String(x), Bson::String(y)) => Some(x.cmp(y)),
        (Bson::Boolean(x), Bson::Boolean(y)) => Some(x.cmp(y)),
        (Bson::DateTime(x), Bson::DateTime(y)) => Some(x.cmp(y)),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => Some(x.bytes().cmp(&y.bytes())),
        (Bson::Timestamp(x), Bson::Timestamp(y)) => {
            Some((x.time, x.increment).cmp(&(y.time, y.increment)))
        }
        (Bson::Null, Bson::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

fn as_f64(v: &Bson) -> Option<f64> {
    match v {
        Bson::Int32(n) => Some(*n as f64),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    }
}

/// Equality with numeric widening.
pub(crate) fn values_equal(a: &Bson, b: &Bson) -> bool {
    match (as_f64(a), as_f64(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn equals_field(field: Option<&Bson>, expected: &Bson) -> bool {
    match (field, expected) {
        (None, Bson::Null) => true,
        (None, _) => false,
        (Some(Bson::Array(items)), expected) if !matches!(expected, Bson::Array(_)) => {
            items.iter().any(|item| values_equal(item, expected))
        }
        (Some(value), expected) => values_equal(value, expected),
    }
}

fn is_operator_doc(value: &Bson) -> Option<&Document> {
    match value {
        Bson::Document(doc) if doc.keys().next().map_or(false, |k| k.starts_with('$')) => Some(doc),
        _ => None,
    }
}

/// Returns true if `doc` satisfies `filter`.
pub(crate) fn matches(doc: &Document, filter: &Document) -> bool {
    filter.iter().all(|(key, expected)| match key.as_str() {
        "$and" => sub_filters(expected).iter().all(|f| matches(doc, f)),
        "$or" => sub_filters(expected).iter().any(|f| matches(doc, f)),
        _ => {
            let field = get_path(doc, key);
            match is_operator_doc(expected) {
                Some(ops) => ops.iter().all(|(op, arg)| match_operator(field, op, arg)),
                None => equals_field(field, expected),
            }
        }
    })
}

fn sub_filters(value: &Bson) -> Vec<Document> {
    match value {
        Bson::Array(items) => items
            .iter()
            .filter_map(|item| item.as_document().cloned())
            .collect(),
        _ => Vec::new(),
    }
}

fn match_operator(field: Option<&Bson>, op: &str, arg: &Bson) -> bool {
    let ordered = |accept: fn(Ordering) -> bool| {
        field
            .and_then(|value| compare(value, arg))
            .map_or(false, accept)
    };
    match op {
        "$gt" => ordered(|o| o == Ordering::Greater),
        "$gte" => ordered(|o| o != Ordering::Less),
        "$lt" => ordered(|o| o == Ordering::Less),
        "$lte" => ordered(|o| o != Ordering::Greater),
        "$ne" => !equals_field(field, arg),
        "$in" => match arg {
            Bson::Array(options) => options.iter().any(|option| equals_field(field, option)),
            _ => false,
        },
        "$exists" => field.is_some() == arg.as_bool().unwrap_or(true),
        _ => false,
    }
}

/// Applies a replacement or `$set`/`$unset`/`$inc` modifier document.
pub(crate) fn apply_update(doc: &mut Document, update: &Document) -> Result<(), String> {
    let is_modifier = update.keys().next().map_or(false, |k| k.starts_with('$'));
    if !is_modifier {
        let id = doc.get("_id").cloned();
        let mut replaced = Document::new();
        if let Some(id) = id {
            replaced.insert("_id", id);
        }
        for (key, value) in update {
            if key != "_id" {
                replaced.insert(key.clone(), value.clone());
            }
        }
        *doc = replaced;
        return Ok(());
    }

    for (op, fields) in update {
        let fields = fields
            .as_document()
            .ok_or_else(|| format!("modifier {} expects a document", op))?;
        for (path, value) in fields {
            match op.as_str() {
                "$set" => set_path(doc, path, value.clone())?,
                "$unset" => remove_path(doc, path),
                "$inc" => {
                    let current = get_path(doc, path).cloned().unwrap_or(Bson::Int32(0));
                    let sum = add_numbers(&current, value)
                        .ok_or_else(|| format!("cannot $inc non-numeric field {}", path))?;
                    set_path(doc, path, sum)?;
                }
                other => return Err(format!("unsupported modifier {}", other)),
            }
        }
    }
    Ok(())
}

fn add_numbers(a: &Bson, b: &Bson) -> Option<Bson> {
    match (a, b) {
        (Bson::Int32(x), Bson::Int32(y)) => Some(
            x.checked_add(*y)
                .map(Bson::Int32)
                .unwrap_or(Bson::Int64(*x as i64 + *y as i64)),
        ),
        (Bson::Int32(_) | Bson::Int64(_), Bson::Int32(_) | Bson::Int64(_)) => {
            Some(Bson::Int64(as_f64(a)? as i64 + as_f64(b)? as i64))
        }
        _ => Some(Bson::Double(as_f64(a)? + as_f64(b)?)),
    }
}

/// Builds the document an upsert inserts when nothing matched.
pub(crate) fn upsert_document(selector: &Document, update: &Document) -> Result<Document, String> {
    let is_modifier = update.keys().next().map_or(false, |k| k.starts_with('$'));
    let mut doc = Document::new();
    if is_modifier {
        for (key, value) in selector {
            if !key.starts_with('$') && is_operator_doc(value).is_none() {
                set_path(&mut doc, key, value.clone())?;
            }
        }
    } else if let Some(id) = selector.get("_id") {
        doc.insert("_id", id.clone());
    }
    apply_update(&mut doc, update)?;
    Ok(doc)
}

/// Sorts by a `{field: 1|-1}` document. Missing fields order first.
pub(crate) fn sort_documents(docs: &mut [Document], order: &Document) {
    docs.sort_by(|a, b| {
        for (field, direction) in order {
            let descending = as_f64(direction).map_or(false, |d| d < 0.0);
            let ordering = match (get_path(a, field), get_path(b, field)) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(x), Some(y)) => compare(x, y).unwrap_or(Ordering::Equal),
            };
            let ordering = if descending { ordering.reverse() } else { ordering };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

/// Applies a field selector. All-zero selectors exclude fields; otherwise
/// only the named fields and `_id` are kept.
pub(crate) fn project(doc: &Document, selector: &Document) -> Document {
    if selector.is_empty() {
        return doc.clone();
    }
    let truthy = |v: &Bson| as_f64(v).map_or_else(|| v.as_bool().unwrap_or(true), |n| n != 0.0);
    let including = selector.iter().any(|(k, v)| k != "_id" && truthy(v));

    if including {
        let mut out = Document::new();
        let keep_id = selector.get("_id").map_or(true, truthy);
        for (key, value) in doc {
            if (key == "_id" && keep_id) || selector.get(key).map_or(false, truthy) {
                out.insert(key.clone(), value.clone());
            }
        }
        out
    } else {
        let mut out = doc.clone();
        for (key, value) in selector {
            if !truthy(value) {
                remove_path(&mut out, key);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_equality_and_operators() {
        let d = doc! { "a": 5, "b": { "c": "x" }, "tags": ["red", "blue"] };
        assert!(matches(&d, &doc! { "a": 5.0 }));
        assert!(matches(&d, &doc! { "b.c": "x" }));
        assert!(matches(&d, &doc! { "tags": "blue" }));
        assert!(matches(&d, &doc! { "a": { "$gt": 1, "$lte": 5 } }));
        assert!(!matches(&d, &doc! { "a": { "$lt": 5 } }));
        assert!(matches(&d, &doc! { "a": { "$in": [1, 5] } }));
        assert!(matches(&d, &doc! { "z": { "$exists": false } }));
        assert!(matches(&d, &doc! { "a": { "$ne": 4 } }));
        assert!(matches(&d, &doc! { "$or": [{ "a": 1 }, { "a": 5 }] }));
        assert!(matches(&d, &doc! { "missing": null }));
    }

    #[test]
    fn test_modifiers() {
        let mut d = doc! { "_id": 1, "n": 1, "gone": true };
        let update = doc! { "$inc": { "n": 2 }, "$set": { "x.y": "z" }, "$unset": { "gone": 1 } };
        apply_update(&mut d, &update).unwrap();
        assert_eq!(d, doc! { "_id": 1, "n": 3, "x": { "y": "z" } });
    }

    #[test]
    fn test_replacement_keeps_id() {
        let mut d = doc! { "_id": 7, "a": 1 };
        apply_update(&mut d, &doc! { "b": 2 }).unwrap();
        assert_eq!(d, doc! { "_id": 7, "b": 2 });
    }

    #[test]
    fn test_upsert_document() {
        let selector = doc! { "k": "v", "n": { "$gt": 1 } };
        let d = upsert_document(&selector, &doc! { "$set": { "x": 1 } }).unwrap();
        assert_eq!(d, doc! { "k": "v", "x": 1 });
    }

    #[test]
    fn test_sort_and_project() {
        let mut docs = vec![
            doc! { "a": 2, "b": 1 },
            doc! { "a": 1, "b": 2 },
            doc! { "a": 2, "b": 3 },
        ];
        sort_documents(&mut docs, &doc! { "a": -1, "b": 1 });
        assert_eq!(docs[0], doc! { "a": 2, "b": 1 });
        assert_eq!(docs[2], doc! { "a": 1, "b": 2 });

        let d = doc! { "_id": 1, "a": 1, "b": 2 };
        assert_eq!(project(&d, &doc! { "a": 1 }), doc! { "_id": 1, "a": 1 });
        assert_eq!(project(&d, &doc! { "a": 1, "_id": 0 }), doc! { "a": 1 });
        assert_eq!(project(&d, &doc! { "b": 0 }), doc! { "_id": 1, "a": 1 });
    }
}
