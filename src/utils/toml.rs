use toml_edit::{DocumentMut, Item, Value};

/// Name of the top-level table that holds the image definitions.
pub const IMAGES_TABLE: &str = "images";

/// Helpers for inspecting and updating craftsbot TOML structures without
/// losing formatting or declaration order.
pub struct TomlUtils;

impl TomlUtils {
    /// Image keys in declaration order. Accepts `[images.x]` tables and inline tables.
    pub fn image_keys(doc: &DocumentMut) -> Vec<String> {
        let Some(images) = doc.get(IMAGES_TABLE) else {
            return Vec::new();
        };

        if let Some(table) = images.as_table() {
            return table.iter().map(|(key, _)| key.to_string()).collect();
        }

        if let Some(inline) = images.as_inline_table() {
            return inline.iter().map(|(key, _)| key.to_string()).collect();
        }

        Vec::new()
    }

    /// Extract the `tag` value of an image entry.
    pub fn extract_tag(item: &Item) -> Option<String> {
        if let Some(table) = item.as_table() {
            return table
                .get("tag")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
        }

        if let Some(inline_table) = item.as_inline_table() {
            return inline_table
                .get("tag")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
        }

        None
    }

    /// Set an image entry's `tag`, returning true if the entry could be updated.
    /// Existing decoration (comments, spacing) around the value is kept.
    pub fn update_tag(item: &mut Item, new_tag: &str) -> bool {
        if let Some(table) = item.as_table_mut() {
            match table.get_mut("tag").and_then(|v| v.as_value_mut()) {
                Some(existing) => replace_keeping_decor(existing, new_tag),
                None => {
                    table.insert("tag", Item::Value(Value::from(new_tag)));
                }
            }
            return true;
        }

        if let Some(inline_table) = item.as_inline_table_mut() {
            match inline_table.get_mut("tag") {
                Some(existing) => replace_keeping_decor(existing, new_tag),
                None => {
                    inline_table.insert("tag", Value::from(new_tag));
                }
            }
            return true;
        }

        false
    }
}

fn replace_keeping_decor(value: &mut Value, new_tag: &str) {
    let decor = value.decor().clone();
    *value = Value::from(new_tag);
    *value.decor_mut() = decor;
}
