diesel::table! {
    drum_availability (vendor_id, delivery_date, drum_size) {
        vendor_id -> Uuid,
        delivery_date -> Date,
        drum_size -> Varchar,
        total_capacity -> Int4,
        reserved_count -> Int4,
        booked_count -> Int4,
        available_count -> Int4,
        created_at -> Nullable<Timestamptz>,
        updated_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    vendor_drum_stock (vendor_id, drum_size) {
        vendor_id -> Uuid,
        drum_size -> Varchar,
        stock -> Int4,
        updated_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    drum_ledger_operations (operation_id) {
        operation_id -> Uuid,
        vendor_id -> Uuid,
        delivery_date -> Date,
        drum_size -> Varchar,
        applied_at -> Nullable<Timestamptz>,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    drum_availability,
    drum_ledger_operations,
    vendor_drum_stock,
);
