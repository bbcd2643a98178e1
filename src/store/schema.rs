diesel::table! {
    kv_entry (key) {
        key -> Text,
        value -> Text,
    }
}
