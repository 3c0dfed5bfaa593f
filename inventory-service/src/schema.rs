diesel::table! {
    products (id) {
        id -> Varchar,
        name -> Varchar,
        stock -> Int4,
        low_stock_threshold -> Int4,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    reservations (id) {
        id -> Uuid,
        order_id -> Uuid,
        product_id -> Varchar,
        quantity -> Int4,
        status -> Varchar,
        idempotency_key -> Nullable<Varchar>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    stock_audit_log (id) {
        id -> Uuid,
        product_id -> Varchar,
        previous_stock -> Int4,
        new_stock -> Int4,
        quantity_change -> Int4,
        operation -> Varchar,
        order_id -> Nullable<Uuid>,
        reservation_id -> Nullable<Uuid>,
        reason -> Nullable<Text>,
        created_at -> Timestamptz,
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

diesel::allow_tables_to_appear_in_same_query!(
    products,
    reservations,
    stock_audit_log,
    outbox_events,
);
