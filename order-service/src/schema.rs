diesel::table! {
    orders (id) {
        id -> Uuid,
        customer_id -> Uuid,
        vendor_id -> Uuid,
        delivery_date -> Date,
        delivery_at -> Timestamptz,
        status -> Varchar,
        payment_status -> Varchar,
        payment_reference -> Nullable<Varchar>,
        total_amount -> Numeric,
        reservation_expires_at -> Timestamptz,
        decline_reason -> Nullable<Varchar>,
        version -> Int4,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    order_items (id) {
        id -> Uuid,
        order_id -> Uuid,
        line_no -> Int4,
        flavor_id -> Uuid,
        drum_size -> Varchar,
        quantity -> Int4,
        unit_price -> Numeric,
        ledger_state -> Varchar,
        ledger_quantity -> Int4,
    }
}

diesel::table! {
    pending_payments (order_id) {
        order_id -> Uuid,
        customer_id -> Uuid,
        expires_at -> Timestamptz,
        reminder_sent -> Bool,
        created_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    processed_payments (reference) {
        reference -> Varchar,
        order_id -> Uuid,
        processed_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    outbox_events (id) {
        id -> Uuid,
        aggregate_id -> Uuid,
        event_type -> Varchar,
        event_data -> Jsonb,
        processed -> Nullable<Bool>,
        created_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    ledger_tasks (id) {
        id -> Uuid,
        seq -> Int8,
        order_id -> Uuid,
        vendor_id -> Uuid,
        delivery_date -> Date,
        drum_size -> Varchar,
        mutation -> Jsonb,
        attempts -> Int4,
        last_error -> Nullable<Text>,
        created_at -> Timestamptz,
        completed_at -> Nullable<Timestamptz>,
    }
}

diesel::joinable!(order_items -> orders (order_id));

diesel::allow_tables_to_appear_in_same_query!(
    orders,
    order_items,
    pending_payments,
    processed_payments,
    outbox_events,
    ledger_tasks,
);
