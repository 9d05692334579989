mod support;

mod optimistic;
