diesel::table! {
    orders (id) {
        id -> Uuid,
        customer_id -> Varchar,
        product_id -> Varchar,
        quantity -> Int4,
        status -> Varchar,
        idempotency_key -> Nullable<Varchar>,
        reservation_id -> Nullable<Uuid>,
        error_message -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        completed_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    outbox_events (id) {
        id -> Uuid,
        aggregate_id -> Varchar,
        event_type -> Varchar,
        event_data -> Jsonb,
        processed -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(orders, outbox_events);
