//! Flattening of the nested vendor listing schema (offers with nested
//! price/area objects, a location object and role-tagged images) into the
//! flat row shape the other adapters produce.

use refe_core::{as_number, as_text, fields, synthesize_title, Category, DealType, RawRow, RowValue};

use crate::markup::{ATTRIBUTE_PREFIX, TEXT_KEY};

/// URL path fragments that identify a floor-plan image.
const PLAN_URL_MARKERS: &[&str] = &["/plan/", "/plans/", "/layout/", "/layouts/", "planirovk"];

/// Values some exporters write instead of real content.
const GENERIC_VALUES: &[&str] = &["array", "[object object]"];

fn attr<'a>(node: &'a RawRow, name: &str) -> Option<&'a RowValue> {
    node.get(&format!("{ATTRIBUTE_PREFIX}{name}"))
}

/// Text of a leaf, or of the `#text` part of an element that also carries
/// attributes. Generic placeholder values count as empty.
fn node_text(value: Option<&RowValue>) -> Option<String> {
    let value = match value {
        Some(RowValue::Map(map)) => map.get(TEXT_KEY),
        other => other,
    };
    let text = as_text(value);
    if text.is_empty() || GENERIC_VALUES.contains(&text.to_lowercase().as_str()) {
        None
    } else {
        Some(text)
    }
}

fn first_text(node: &RawRow, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| node_text(node.get(k)))
}

/// `<price><value>…</value></price>` or a bare `<price>…</price>`.
fn unwrap_number(value: Option<&RowValue>) -> Option<f64> {
    match value {
        Some(RowValue::Map(map)) => match map.get("value") {
            Some(inner) => as_number(Some(inner)),
            None => as_number(map.get(TEXT_KEY)),
        },
        other => as_number(other),
    }
}

fn first_number(node: &RawRow, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| unwrap_number(node.get(k)))
}

fn is_truthy(text: &str) -> bool {
    matches!(
        text.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "да" | "+"
    )
}

fn each<'a>(value: Option<&'a RowValue>) -> Vec<&'a RowValue> {
    match value {
        Some(RowValue::List(items)) => items.iter().collect(),
        Some(other) => vec![other],
        None => Vec::new(),
    }
}

fn metro_names(location: &RawRow) -> Vec<String> {
    each(location.get("metro"))
        .into_iter()
        .filter_map(|station| match station {
            RowValue::Map(map) => first_text(map, &["name"]),
            other => node_text(Some(other)),
        })
        .collect()
}

/// Photos first, then plans. Consumers take index 0 as the cover image, so a
/// plan must never lead the list.
fn partition_images(node: &RawRow) -> Vec<String> {
    let mut photos = Vec::new();
    let mut plans = Vec::new();
    for image in each(node.get("image")) {
        let Some(url) = node_text(Some(image)) else {
            continue;
        };
        let tagged_plan = image
            .as_map()
            .and_then(|m| attr(m, "tag"))
            .map(|t| as_text(Some(t)).eq_ignore_ascii_case("plan"))
            .unwrap_or(false);
        let lower = url.to_lowercase();
        if tagged_plan || PLAN_URL_MARKERS.iter().any(|m| lower.contains(m)) {
            plans.push(url);
        } else {
            photos.push(url);
        }
    }
    photos.extend(plans);
    photos
}

fn infer_category(node: &RawRow, deal_type: DealType) -> Category {
    if deal_type == DealType::Rent {
        return Category::Rent;
    }
    let new_flat = first_text(node, &["new-flat", "newbuilding", "new-building"])
        .is_some_and(|t| is_truthy(&t));
    if new_flat {
        return Category::Newbuild;
    }
    let status = first_text(node, &["deal-status"]).unwrap_or_default().to_lowercase();
    if status.contains("primary") || status.contains("первичн") {
        Category::Newbuild
    } else {
        Category::Secondary
    }
}

fn handover(node: &RawRow) -> Option<String> {
    let year = first_text(node, &["built-year", "ready-year"]);
    let quarter = first_text(node, &["ready-quarter", "built-quarter"]);
    match (year, quarter) {
        (Some(y), Some(q)) => Some(format!("Q{q} {y}")),
        (Some(y), None) => Some(y),
        (None, _) => first_text(node, &["handover-date", "deadline"]),
    }
}

fn category_label(category: Category) -> &'static str {
    match category {
        Category::Newbuild => "newbuild",
        Category::Secondary => "secondary",
        Category::Rent => "rent",
    }
}

fn put_text(row: &mut RawRow, key: &str, value: Option<String>) {
    if let Some(value) = value {
        row.insert(key, value);
    }
}

/// Flattens one vendor offer node.
pub fn normalize_offer(node: &RawRow) -> RawRow {
    let mut row = RawRow::new();

    let external_id = node_text(attr(node, "internal-id"))
        .or_else(|| first_text(node, &["internal-id", "id", "external-id"]));
    put_text(&mut row, fields::EXTERNAL_ID, external_id);

    let deal_type = DealType::parse(&first_text(node, &["type"]).unwrap_or_default());
    row.insert(
        fields::DEAL_TYPE,
        match deal_type {
            DealType::Sale => "sale",
            DealType::Rent => "rent",
        },
    );
    row.insert(fields::CATEGORY, category_label(infer_category(node, deal_type)));

    let numbers = [
        (fields::PRICE, &["price"][..]),
        (fields::OLD_PRICE, &["oldprice", "old-price"][..]),
        (fields::AREA_TOTAL, &["area"][..]),
        (fields::AREA_LIVING, &["living-space"][..]),
        (fields::AREA_KITCHEN, &["kitchen-space"][..]),
        (fields::BEDROOMS, &["rooms"][..]),
        (fields::FLOOR, &["floor"][..]),
        (fields::FLOORS_TOTAL, &["floors-total"][..]),
    ];
    for (key, sources) in numbers {
        if let Some(n) = first_number(node, sources) {
            row.insert(key, n);
        }
    }

    if let Some(location) = node.get("location").and_then(RowValue::as_map) {
        put_text(
            &mut row,
            fields::ADDRESS,
            first_text(location, &["address", "sub-locality-name", "locality-name", "region"]),
        );
        put_text(
            &mut row,
            fields::DISTRICT,
            first_text(location, &["sub-locality-name", "district"]),
        );
        let metro = metro_names(location);
        if !metro.is_empty() {
            row.insert(fields::METRO, metro.join(", "));
        }
    }

    let images = partition_images(node);
    if !images.is_empty() {
        row.insert(
            fields::IMAGES,
            RowValue::List(images.into_iter().map(RowValue::Text).collect()),
        );
    }

    let building_name = first_text(node, &["building-name", "complex-name"]);
    row.insert(
        fields::TITLE,
        synthesize_title(first_number(node, &["rooms"]), building_name.as_deref()),
    );
    put_text(&mut row, fields::COMPLEX_TITLE, building_name);
    put_text(
        &mut row,
        fields::COMPLEX_EXTERNAL_ID,
        first_text(node, &["yandex-building-id", "building-id", "complex-id"]),
    );

    let developer = first_text(node, &["developer"]).or_else(|| {
        node.get("sales-agent")
            .and_then(RowValue::as_map)
            .and_then(|agent| first_text(agent, &["organization", "name"]))
    });
    put_text(&mut row, fields::DEVELOPER, developer);
    put_text(&mut row, fields::HANDOVER_DATE, handover(node));
    put_text(&mut row, fields::BUILDING_CLASS, first_text(node, &["building-class", "class"]));
    put_text(&mut row, fields::FINISH_TYPE, first_text(node, &["renovation", "decoration"]));
    put_text(&mut row, fields::DESCRIPTION, first_text(node, &["description"]));

    row
}
