diesel::table! {
    video_renditions (id) {
        id -> Uuid,
        video_id -> Uuid,
        label -> Varchar,
        file_path -> Varchar,
        width -> Int4,
        height -> Int4,
        bitrate_kbps -> Int4,
        container -> Varchar,
        file_size -> Int8,
        is_primary -> Bool,
        created_at -> Timestamp,
    }
}

diesel::table! {
    videos (id) {
        id -> Uuid,
        slug -> Varchar,
        title -> Varchar,
        description -> Nullable<Text>,
        creator_id -> Uuid,
        status -> Varchar,
        processing_status -> Varchar,
        processing_progress -> Int2,
        processing_error -> Nullable<Text>,
        retry_count -> Int4,
        temp_video_file -> Nullable<Varchar>,
        poster_path -> Nullable<Varchar>,
        poster_offset_secs -> Nullable<Float8>,
        preview_path -> Nullable<Varchar>,
        duration -> Nullable<Float8>,
        width -> Nullable<Int4>,
        height -> Nullable<Int4>,
        video_codec -> Nullable<Varchar>,
        claim_token -> Nullable<Uuid>,
        created_at -> Timestamp,
        updated_at -> Timestamp,
        processing_started_at -> Nullable<Timestamp>,
        published_at -> Nullable<Timestamp>,
    }
}

diesel::table! {
    encoding_jobs (id) {
        id -> Int8,
        payload -> Text,
        deliveries -> Int4,
        available_at -> Timestamp,
        locked_until -> Nullable<Timestamp>,
        created_at -> Timestamp,
    }
}

diesel::joinable!(video_renditions -> videos (video_id));

diesel::allow_tables_to_appear_in_same_query!(video_renditions, videos, encoding_jobs,);
